//! 行/区域可见性
//!
//! 每个分组一个布尔开关，默认可见。本地按 `visibility:{group}` 持久化，
//! 远端镜像到 `visibility/current` 单文档，跨设备冲突按最后写入者胜出。

use crate::error::{PlayaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 远端可见性文档 ID
pub const VISIBILITY_DOCUMENT_ID: &str = "current";

/// 可见性分组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityGroup {
    Row0,
    Row1,
    Row2,
    Row3,
    Row4,
    Row8,
    FreeZone1,
    FreeZone2,
    Seat10A,
    Seat0,
    Circles,
}

impl VisibilityGroup {
    pub const ALL: [VisibilityGroup; 11] = [
        VisibilityGroup::Row0,
        VisibilityGroup::Row1,
        VisibilityGroup::Row2,
        VisibilityGroup::Row3,
        VisibilityGroup::Row4,
        VisibilityGroup::Row8,
        VisibilityGroup::FreeZone1,
        VisibilityGroup::FreeZone2,
        VisibilityGroup::Seat10A,
        VisibilityGroup::Seat0,
        VisibilityGroup::Circles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityGroup::Row0 => "row0",
            VisibilityGroup::Row1 => "row1",
            VisibilityGroup::Row2 => "row2",
            VisibilityGroup::Row3 => "row3",
            VisibilityGroup::Row4 => "row4",
            VisibilityGroup::Row8 => "row8",
            VisibilityGroup::FreeZone1 => "free_zone1",
            VisibilityGroup::FreeZone2 => "free_zone2",
            VisibilityGroup::Seat10A => "seat10_a",
            VisibilityGroup::Seat0 => "seat0",
            VisibilityGroup::Circles => "circles",
        }
    }
}

impl fmt::Display for VisibilityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisibilityGroup {
    type Err = PlayaError;

    fn from_str(s: &str) -> Result<Self> {
        VisibilityGroup::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| PlayaError::InvalidArgument(format!("未知可见性分组: {}", s)))
    }
}

/// 全部分组的可见性
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VisibilityState {
    /// 只记录显式设置过的分组，缺省视为可见
    pub groups: BTreeMap<VisibilityGroup, bool>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl VisibilityState {
    pub fn is_visible(&self, group: VisibilityGroup) -> bool {
        self.groups.get(&group).copied().unwrap_or(true)
    }

    pub fn set(&mut self, group: VisibilityGroup, visible: bool, at: DateTime<Utc>) {
        self.groups.insert(group, visible);
        self.last_updated = Some(at);
    }

    /// 翻转并返回新值
    pub fn toggle(&mut self, group: VisibilityGroup, at: DateTime<Utc>) -> bool {
        let visible = !self.is_visible(group);
        self.set(group, visible, at);
        visible
    }

    pub fn hidden_groups(&self) -> Vec<VisibilityGroup> {
        VisibilityGroup::ALL
            .iter()
            .copied()
            .filter(|g| !self.is_visible(*g))
            .collect()
    }

    /// 远端文档：`{ "groups": { "row0": true, ... } }`
    pub fn to_document(&self) -> Result<serde_json::Value> {
        let groups: BTreeMap<&str, bool> = VisibilityGroup::ALL
            .iter()
            .map(|g| (g.as_str(), self.is_visible(*g)))
            .collect();
        Ok(serde_json::json!({ "groups": groups }))
    }

    /// 解析远端文档，未知分组忽略
    pub fn from_document(data: &serde_json::Value, update_time: DateTime<Utc>) -> Result<Self> {
        let groups = data
            .get("groups")
            .and_then(|g| g.as_object())
            .ok_or_else(|| PlayaError::InvalidData("可见性文档缺少 groups".to_string()))?;

        let mut state = VisibilityState {
            groups: BTreeMap::new(),
            last_updated: Some(update_time),
        };
        for (name, value) in groups {
            match (name.parse::<VisibilityGroup>(), value.as_bool()) {
                (Ok(group), Some(visible)) => {
                    state.groups.insert(group, visible);
                }
                _ => tracing::debug!("忽略未知可见性字段: {}", name),
            }
        }
        Ok(state)
    }

    /// 远端状态严格更新时才覆盖
    pub fn is_superseded_by(&self, remote_time: DateTime<Utc>) -> bool {
        self.last_updated.map_or(true, |local| remote_time > local)
    }
}
