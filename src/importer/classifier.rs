// ==========================================
// SPED 账簿导入系统 - 记录分类器
// ==========================================
// 职责: 按 (记录类型, CFOP) 查静态规则表，决定落库类别或显式忽略
// 约束:
// - 纯函数，无 I/O，结果只取决于输入行
// - 每个明细记录类型都以兜底规则收尾，不存在未分类的明细行
// ==========================================

use crate::domain::ledger::FiscalRecordLine;
use crate::domain::types::LedgerCategory;

/// C170 的 CFOP 位置（REG 为位置 1）
pub const C170_CFOP_POSITION: usize = 11;

/// 使用与消耗（在用材料 / 消耗品）
pub const USAGE_CONSUMPTION_CFOPS: &[&str] = &["1556", "2556", "3556", "1557", "2557", "1407", "2407"];

/// 固定资产
pub const FIXED_ASSET_CFOPS: &[&str] = &["1551", "2551", "3551", "1552", "2552", "1406", "2406"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeMatch {
    Any,
    Codes(&'static [&'static str]),
}

impl CodeMatch {
    fn matches(&self, code: Option<&str>) -> bool {
        match self {
            CodeMatch::Any => true,
            CodeMatch::Codes(codes) => code.map(|c| codes.contains(&c)).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Persist(LedgerCategory),
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationRule {
    pub record_type: &'static str,
    pub codes: CodeMatch,
    pub disposition: Disposition,
}

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 写入该类别
    Persist(LedgerCategory),
    /// 明细记录，但按规则不落库（如普通转售 CFOP）
    Ignore,
    /// 非明细记录（头、参与方、块开闭等）
    NotDetail,
}

/// 默认规则表（按顺序匹配，首条命中生效）
pub const DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        record_type: "C100",
        codes: CodeMatch::Any,
        disposition: Disposition::Persist(LedgerCategory::Goods),
    },
    ClassificationRule {
        record_type: "C170",
        codes: CodeMatch::Codes(USAGE_CONSUMPTION_CFOPS),
        disposition: Disposition::Persist(LedgerCategory::UsageConsumption),
    },
    ClassificationRule {
        record_type: "C170",
        codes: CodeMatch::Codes(FIXED_ASSET_CFOPS),
        disposition: Disposition::Persist(LedgerCategory::FixedAsset),
    },
    ClassificationRule {
        record_type: "C170",
        codes: CodeMatch::Any,
        disposition: Disposition::Ignore,
    },
    ClassificationRule {
        record_type: "C500",
        codes: CodeMatch::Any,
        disposition: Disposition::Persist(LedgerCategory::EnergyWater),
    },
    ClassificationRule {
        record_type: "D100",
        codes: CodeMatch::Any,
        disposition: Disposition::Persist(LedgerCategory::Freight),
    },
    ClassificationRule {
        record_type: "A100",
        codes: CodeMatch::Any,
        disposition: Disposition::Persist(LedgerCategory::Services),
    },
];

/// 参与规则匹配的业务代码（目前仅 C170 的 CFOP）
fn code_of(line: &FiscalRecordLine) -> Option<&str> {
    match line.record_type.as_str() {
        "C170" => line.field(C170_CFOP_POSITION),
        _ => None,
    }
}

// ==========================================
// RecordClassifier
// ==========================================
#[derive(Debug, Clone)]
pub struct RecordClassifier {
    rules: &'static [ClassificationRule],
}

impl Default for RecordClassifier {
    fn default() -> Self {
        Self { rules: DEFAULT_RULES }
    }
}

impl RecordClassifier {
    /// 分类一行
    pub fn classify(&self, line: &FiscalRecordLine) -> Classification {
        let code = code_of(line);
        let mut is_detail = false;
        for rule in self.rules.iter().filter(|r| r.record_type == line.record_type) {
            is_detail = true;
            if rule.codes.matches(code) {
                return match rule.disposition {
                    Disposition::Persist(category) => Classification::Persist(category),
                    Disposition::Ignore => Classification::Ignore,
                };
            }
        }
        if is_detail {
            // 默认规则表每个明细类型都以 Any 收尾，此处不可达
            Classification::Ignore
        } else {
            Classification::NotDetail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(record_type: &str, cfop: Option<&str>) -> FiscalRecordLine {
        let mut fields = vec![record_type.to_string()];
        fields.extend((2..=12).map(|_| String::new()));
        if let Some(c) = cfop {
            fields[C170_CFOP_POSITION - 1] = c.to_string();
        }
        FiscalRecordLine {
            record_type: record_type.to_string(),
            fields,
            byte_offset: 0,
            end_offset: 1,
            line_no: 1,
        }
    }

    /// 每个明细记录类型的最后一条规则必须是 Any 兜底
    fn check_fallbacks(rules: &[ClassificationRule]) -> Result<(), String> {
        let mut seen: Vec<&str> = Vec::new();
        for rule in rules {
            if !seen.contains(&rule.record_type) {
                seen.push(rule.record_type);
            }
        }
        for record_type in seen {
            match rules.iter().filter(|r| r.record_type == record_type).last() {
                Some(rule) if rule.codes == CodeMatch::Any => {}
                _ => return Err(format!("记录类型 {} 缺少兜底规则", record_type)),
            }
        }
        Ok(())
    }

    #[test]
    fn test_default_rules_are_total() {
        assert!(check_fallbacks(DEFAULT_RULES).is_ok());
    }

    #[test]
    fn test_cfop_mapping() {
        let c = RecordClassifier::default();
        for code in USAGE_CONSUMPTION_CFOPS {
            assert_eq!(
                c.classify(&line("C170", Some(*code))),
                Classification::Persist(LedgerCategory::UsageConsumption)
            );
        }
        for code in FIXED_ASSET_CFOPS {
            assert_eq!(
                c.classify(&line("C170", Some(*code))),
                Classification::Persist(LedgerCategory::FixedAsset)
            );
        }
        assert_eq!(c.classify(&line("C170", Some("5102"))), Classification::Ignore);
        assert_eq!(c.classify(&line("C170", None)), Classification::Ignore);
    }

    #[test]
    fn test_record_types() {
        let c = RecordClassifier::default();
        assert_eq!(
            c.classify(&line("C100", None)),
            Classification::Persist(LedgerCategory::Goods)
        );
        assert_eq!(
            c.classify(&line("C500", None)),
            Classification::Persist(LedgerCategory::EnergyWater)
        );
        assert_eq!(
            c.classify(&line("D100", None)),
            Classification::Persist(LedgerCategory::Freight)
        );
        assert_eq!(
            c.classify(&line("A100", None)),
            Classification::Persist(LedgerCategory::Services)
        );
        assert_eq!(c.classify(&line("0150", None)), Classification::NotDetail);
        assert_eq!(c.classify(&line("C190", None)), Classification::NotDetail);
    }

    #[test]
    fn test_rule_table_without_fallback_is_rejected() {
        static PARTIAL: &[ClassificationRule] = &[ClassificationRule {
            record_type: "C170",
            codes: CodeMatch::Codes(FIXED_ASSET_CFOPS),
            disposition: Disposition::Persist(LedgerCategory::FixedAsset),
        }];
        assert!(check_fallbacks(PARTIAL).is_err());
    }
}
