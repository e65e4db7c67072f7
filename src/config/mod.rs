// ==========================================
// SPED 账簿导入系统 - 配置层
// ==========================================
// 职责: 管线参数默认值 + config_kv 覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod pipeline_config;

pub use config_manager::{config_keys, ConfigManager};
pub use pipeline_config::PipelineConfig;
