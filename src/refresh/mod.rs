// ==========================================
// SPED 账簿导入系统 - 视图刷新
// ==========================================

pub mod view_refresh;

pub use view_refresh::{
    RefreshReport, RefreshRequest, SqliteViewRefresher, ViewRefreshTrigger, ViewRefresher,
};
