//! 标识解析器
//!
//! 分析仪发来的原始标识按严格顺序解析，命中即停：
//! 1. LIS短码（样本标签上的小数字，操作员键入）→ 查发票
//! 2. 身份证号 → 直接查患者
//! 3. 都未命中 → 交给重试队列。这不是错误，结果先于管理录入到达是常态。
//!
//! 顺序有意为之: 短码命中能带回发票/就诊上下文，哪怕该串碰巧也像身份证号。

use crate::store::AdminStore;
use lis_core::models::ResolvedTarget;
use lis_core::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// 解析器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// LIS短码下界（含）
    pub short_code_min: u32,
    /// LIS短码上界（含）
    pub short_code_max: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            short_code_min: 1000,
            short_code_max: 99_999,
        }
    }
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedTarget),
    /// 未解析：应进入重试队列
    Unresolved,
}

/// 标识解析器
pub struct IdentifierResolver {
    store: Arc<dyn AdminStore>,
    config: ResolverConfig,
}

impl IdentifierResolver {
    pub fn new(store: Arc<dyn AdminStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// 解析一个原始标识
    pub async fn resolve(&self, raw_identifier: &str) -> Result<Resolution> {
        let raw = raw_identifier.trim();
        if raw.is_empty() {
            return Ok(Resolution::Unresolved);
        }

        // 策略1: LIS短码 → 发票
        if let Ok(code) = raw.parse::<u32>() {
            if code >= self.config.short_code_min && code <= self.config.short_code_max {
                if let Some(invoice) = self.store.find_invoice_by_short_code(code).await? {
                    info!(
                        "identifier {} resolved via short code -> invoice {}",
                        raw, invoice.number
                    );
                    return Ok(Resolution::Resolved(ResolvedTarget {
                        patient_id: invoice.patient_id,
                        visit_id: invoice.visit_id,
                        invoice_id: Some(invoice.id),
                        study_id: None,
                    }));
                }
            }
        }

        // 策略2: 身份证号 → 患者
        if let Some(patient) = self.store.find_patient_by_national_id(raw).await? {
            info!(
                "identifier {} resolved via national id -> patient {}",
                raw,
                patient.full_name()
            );
            return Ok(Resolution::Resolved(ResolvedTarget {
                patient_id: patient.id,
                visit_id: None,
                invoice_id: None,
                study_id: None,
            }));
        }

        debug!("identifier {} not resolved, deferring to retry queue", raw);
        Ok(Resolution::Unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryAdminStore, Invoice, Patient};
    use uuid::Uuid;

    async fn store_with_fixtures() -> (Arc<InMemoryAdminStore>, Uuid, Uuid) {
        let store = Arc::new(InMemoryAdminStore::new());

        let invoice_patient = Uuid::new_v4();
        store
            .insert_patient(Patient {
                id: invoice_patient,
                cedula: "2024".to_string(), // 身份证号碰巧落在短码范围内
                first_name: "Maria".to_string(),
                last_name: "Santos".to_string(),
            })
            .await;

        let direct_patient = Uuid::new_v4();
        store
            .insert_patient(Patient {
                id: direct_patient,
                cedula: "00123456789".to_string(),
                first_name: "Juan".to_string(),
                last_name: "Perez".to_string(),
            })
            .await;

        store
            .insert_invoice(Invoice {
                id: Uuid::new_v4(),
                number: "F-0001".to_string(),
                short_code: 2024,
                patient_id: invoice_patient,
                visit_id: Some(Uuid::new_v4()),
            })
            .await;

        (store, invoice_patient, direct_patient)
    }

    #[tokio::test]
    async fn test_short_code_preferred_over_cedula() {
        let (store, invoice_patient, _) = store_with_fixtures().await;
        let resolver = IdentifierResolver::new(store, ResolverConfig::default());

        // "2024" 同时是短码和某患者的身份证号: 短码必须优先
        match resolver.resolve("2024").await.unwrap() {
            Resolution::Resolved(target) => {
                assert_eq!(target.patient_id, invoice_patient);
                assert!(target.invoice_id.is_some());
                assert!(target.visit_id.is_some());
            }
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[tokio::test]
    async fn test_cedula_fallback() {
        let (store, _, direct_patient) = store_with_fixtures().await;
        let resolver = IdentifierResolver::new(store, ResolverConfig::default());

        match resolver.resolve("00123456789").await.unwrap() {
            Resolution::Resolved(target) => {
                assert_eq!(target.patient_id, direct_patient);
                assert!(target.invoice_id.is_none());
            }
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[tokio::test]
    async fn test_unknown_identifier_unresolved() {
        let (store, _, _) = store_with_fixtures().await;
        let resolver = IdentifierResolver::new(store, ResolverConfig::default());

        assert_eq!(resolver.resolve("99999999999").await.unwrap(), Resolution::Unresolved);
        assert_eq!(resolver.resolve("").await.unwrap(), Resolution::Unresolved);
    }

    #[tokio::test]
    async fn test_numeric_outside_range_not_treated_as_short_code() {
        let (store, _, _) = store_with_fixtures().await;
        let resolver = IdentifierResolver::new(
            store,
            ResolverConfig { short_code_min: 5000, short_code_max: 99_999 },
        );

        // 2024 在配置范围之外 → 跳过发票查找，但身份证号策略仍命中
        match resolver.resolve("2024").await.unwrap() {
            Resolution::Resolved(target) => assert!(target.invoice_id.is_none()),
            Resolution::Unresolved => panic!("expected cedula fallback"),
        }
    }
}
