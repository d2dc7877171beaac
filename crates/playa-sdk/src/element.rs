//! 元素状态机 - 躺椅（Seat）与圆点（Circle）
//!
//! 每个元素只有两项状态：颜色步骤（step）与顾客名。
//! - 躺椅：step ∈ [0, 6]
//! - 圆点：step ∈ [0, 3]
//!
//! 双击循环：0 → 1 → … → N → 1（不会回到 0）；右键菜单可直接选任意合法步骤。

use crate::error::{PlayaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Seat,
    Circle,
}

impl ElementKind {
    /// 该类型允许的最大步骤
    pub const fn max_step(&self) -> u8 {
        match self {
            ElementKind::Seat => 6,
            ElementKind::Circle => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Seat => "seat",
            ElementKind::Circle => "circle",
        }
    }

    /// 顾客名只挂在躺椅上
    pub fn supports_customer_name(&self) -> bool {
        matches!(self, ElementKind::Seat)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 元素 ID（页面上的节点 id，如 `sunbed`、`clon_12`、`circle_3`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(PlayaError::InvalidArgument("元素 ID 不能为空".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for ElementId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ElementId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 颜色步骤，构造时校验范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(u8);

impl Step {
    pub const ZERO: Step = Step(0);

    pub fn new(kind: ElementKind, value: u8) -> Result<Self> {
        if value > kind.max_step() {
            return Err(PlayaError::InvalidStep {
                kind: kind.to_string(),
                step: value,
                max: kind.max_step(),
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// 循环到下一个步骤：N → 1，其余 +1
    pub fn next(&self, kind: ElementKind) -> Step {
        if self.0 >= kind.max_step() {
            Step(1)
        } else {
            Step(self.0 + 1)
        }
    }

    /// 对应的样式类名（step 0 无样式）
    pub fn css_class(&self) -> Option<String> {
        (self.0 > 0).then(|| format!("step{}", self.0))
    }
}

/// 单个元素的完整状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub id: ElementId,
    pub kind: ElementKind,
    pub step: Step,
    pub customer_name: Option<String>,
    /// 最后更新时间；服务端确认后替换为服务端时间
    pub last_updated: Option<DateTime<Utc>>,
}

impl ElementState {
    /// 无本地记录时的默认状态：step = 0，无顾客名
    pub fn new(id: ElementId, kind: ElementKind) -> Self {
        Self {
            id,
            kind,
            step: Step::ZERO,
            customer_name: None,
            last_updated: None,
        }
    }

    /// 双击循环
    pub fn toggle(&mut self) -> Step {
        self.step = self.step.next(self.kind);
        self.step
    }

    /// 直接设置步骤（颜色菜单）
    pub fn set_step(&mut self, value: u8) -> Result<Step> {
        self.step = Step::new(self.kind, value)?;
        Ok(self.step)
    }

    /// 设置顾客名，空白串视为清除
    pub fn set_customer_name(&mut self, name: Option<&str>) -> Result<()> {
        if !self.kind.supports_customer_name() {
            return Err(PlayaError::InvalidOperation(format!(
                "{} 不支持顾客名: {}",
                self.kind, self.id
            )));
        }
        self.customer_name = normalize_name(name);
        Ok(())
    }
}

pub(crate) fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat(id: &str) -> ElementState {
        ElementState::new(ElementId::new(id).unwrap(), ElementKind::Seat)
    }

    #[test]
    fn test_toggle_wraps_and_stays_in_range() {
        for kind in [ElementKind::Seat, ElementKind::Circle] {
            let mut state = ElementState::new(ElementId::new("x").unwrap(), kind);
            let mut seen = Vec::new();
            for _ in 0..(kind.max_step() as usize * 3) {
                let step = state.toggle();
                assert!(step.value() >= 1 && step.value() <= kind.max_step());
                seen.push(step.value());
            }
            // 第一次从 0 进入 1，N 之后回到 1
            assert_eq!(seen[0], 1);
            assert_eq!(seen[kind.max_step() as usize - 1], kind.max_step());
            assert_eq!(seen[kind.max_step() as usize], 1);
        }
    }

    #[test]
    fn test_set_step_validates_kind_range() {
        let mut state = seat("clon_1");
        assert_eq!(state.set_step(6).unwrap().value(), 6);
        assert!(state.set_step(7).is_err());
        assert_eq!(state.step.value(), 6);

        let mut circle = ElementState::new(ElementId::new("circle_0").unwrap(), ElementKind::Circle);
        assert!(matches!(
            circle.set_step(4),
            Err(PlayaError::InvalidStep { max: 3, .. })
        ));
        assert_eq!(circle.set_step(0).unwrap(), Step::ZERO);
    }

    #[test]
    fn test_customer_name_only_on_seats() {
        let mut state = seat("clon_2");
        state.set_customer_name(Some("  Juan ")).unwrap();
        assert_eq!(state.customer_name.as_deref(), Some("Juan"));
        state.set_customer_name(Some("   ")).unwrap();
        assert!(state.customer_name.is_none());

        let mut circle = ElementState::new(ElementId::new("circle_1").unwrap(), ElementKind::Circle);
        assert!(circle.set_customer_name(Some("Ana")).is_err());
    }

    #[test]
    fn test_css_class() {
        assert_eq!(Step::ZERO.css_class(), None);
        assert_eq!(Step::new(ElementKind::Seat, 4).unwrap().css_class().as_deref(), Some("step4"));
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(ElementId::new("  ").is_err());
    }
}
