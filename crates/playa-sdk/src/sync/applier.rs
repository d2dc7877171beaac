//! 远端变更应用规则（最后写入者胜出）

use crate::element::{normalize_name, ElementKind, ElementState, Step};
use crate::error::{PlayaError, Result};
use crate::remote::RemoteDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 元素在远端的文档形态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDocument {
    pub step: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
}

impl ElementDocument {
    pub fn from_state(state: &ElementState) -> Self {
        Self {
            step: state.step.value(),
            customer_name: state.customer_name.clone(),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        // 清除顾客名时需要显式写 null 覆盖远端旧值
        if self.customer_name.is_none() {
            if let Some(map) = value.as_object_mut() {
                map.insert("customer_name".to_string(), serde_json::Value::Null);
            }
        }
        Ok(value)
    }
}

/// 应用决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Apply,
    /// 远端不比本地新
    IgnoreStale,
}

/// 远端时间严格晚于本地缓存（或本地从未写过）才覆盖
pub fn decide(local_updated: Option<DateTime<Utc>>, remote_updated: DateTime<Utc>) -> ApplyDecision {
    match local_updated {
        Some(local) if remote_updated <= local => ApplyDecision::IgnoreStale,
        _ => ApplyDecision::Apply,
    }
}

/// 把远端文档合并进本地状态；步骤越界视为数据错误
pub fn merge_document(current: &ElementState, document: &RemoteDocument) -> Result<ElementState> {
    let parsed: ElementDocument = serde_json::from_value(document.data.clone()).map_err(|e| {
        PlayaError::InvalidData(format!("元素文档格式错误 {}/{}: {}", document.collection, document.id, e))
    })?;

    let mut next = current.clone();
    next.step = Step::new(current.kind, parsed.step)?;
    if current.kind == ElementKind::Seat {
        next.customer_name = normalize_name(parsed.customer_name.as_deref());
    }
    next.last_updated = Some(document.update_time);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementId;
    use crate::remote::Collection;
    use chrono::Duration;
    use serde_json::json;

    fn doc(data: serde_json::Value, at: DateTime<Utc>) -> RemoteDocument {
        RemoteDocument {
            collection: Collection::Seats,
            id: "clon_1".to_string(),
            data,
            update_time: at,
        }
    }

    #[test]
    fn test_decide_strictly_newer() {
        let now = Utc::now();
        assert_eq!(decide(None, now), ApplyDecision::Apply);
        assert_eq!(decide(Some(now), now), ApplyDecision::IgnoreStale);
        assert_eq!(decide(Some(now), now - Duration::seconds(1)), ApplyDecision::IgnoreStale);
        assert_eq!(decide(Some(now), now + Duration::milliseconds(1)), ApplyDecision::Apply);
    }

    #[test]
    fn test_merge_document() {
        let current = ElementState::new(ElementId::new("clon_1").unwrap(), ElementKind::Seat);
        let at = Utc::now();
        let merged = merge_document(&current, &doc(json!({"step": 5, "customer_name": "Eva"}), at)).unwrap();
        assert_eq!(merged.step.value(), 5);
        assert_eq!(merged.customer_name.as_deref(), Some("Eva"));
        assert_eq!(merged.last_updated, Some(at));

        let cleared = merge_document(&merged, &doc(json!({"step": 0, "customer_name": null}), at)).unwrap();
        assert!(cleared.customer_name.is_none());
    }

    #[test]
    fn test_merge_rejects_out_of_range() {
        let current = ElementState::new(ElementId::new("circle_1").unwrap(), ElementKind::Circle);
        assert!(merge_document(&current, &doc(json!({"step": 4}), Utc::now())).is_err());
        assert!(merge_document(&current, &doc(json!({"color": 1}), Utc::now())).is_err());
    }

    #[test]
    fn test_document_clears_name_explicitly() {
        let value = ElementDocument { step: 2, customer_name: None }.to_value().unwrap();
        assert_eq!(value, json!({"step": 2, "customer_name": null}));
    }
}
