//! 元素注册表
//!
//! 页面加载时一次性登记所有躺椅与圆点（静态布局），会话内不再销毁。

use crate::element::{ElementId, ElementKind};
use crate::error::{PlayaError, Result};
use crate::visibility::VisibilityGroup;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// 模板躺椅的 ID，其余躺椅由它克隆而来
pub const TEMPLATE_SEAT_ID: &str = "sunbed";
/// 克隆躺椅数量（clon_1 ..= clon_125）
pub const CLONED_SEAT_COUNT: u32 = 125;
/// 默认圆点数量
pub const DEFAULT_CIRCLE_COUNT: u32 = 12;

/// 注册项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementEntry {
    pub id: ElementId,
    pub kind: ElementKind,
    /// 显示标签，默认与 ID 相同
    pub label: String,
    pub groups: Vec<VisibilityGroup>,
}

/// 元素注册表
#[derive(Debug, Clone, Default)]
pub struct ElementRegistry {
    entries: BTreeMap<ElementId, ElementEntry>,
    by_group: HashMap<VisibilityGroup, Vec<ElementId>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标准海滩布局：模板躺椅 + 125 个克隆躺椅 + `circle_count` 个圆点
    pub fn standard_layout(circle_count: u32) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(ElementId::new(TEMPLATE_SEAT_ID)?, ElementKind::Seat, None)?;

        for n in 1..=CLONED_SEAT_COUNT {
            let id = ElementId::new(format!("clon_{}", n))?;
            registry.register(id.clone(), ElementKind::Seat, None)?;
            for group in seat_groups(n) {
                registry.assign_group(&id, *group)?;
            }
        }

        for n in 0..circle_count {
            let id = ElementId::new(format!("circle_{}", n))?;
            registry.register(id.clone(), ElementKind::Circle, None)?;
            registry.assign_group(&id, VisibilityGroup::Circles)?;
        }

        debug!(
            "标准布局已登记: {} 个元素（圆点 {} 个）",
            registry.len(),
            circle_count
        );
        Ok(registry)
    }

    /// 登记元素；重复 ID 视为错误
    pub fn register(&mut self, id: ElementId, kind: ElementKind, label: Option<String>) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(PlayaError::InvalidArgument(format!("元素重复登记: {}", id)));
        }
        let label = label.unwrap_or_else(|| id.to_string());
        self.entries.insert(
            id.clone(),
            ElementEntry {
                id,
                kind,
                label,
                groups: Vec::new(),
            },
        );
        Ok(())
    }

    /// 把元素归入可见性分组
    pub fn assign_group(&mut self, id: &ElementId, group: VisibilityGroup) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| PlayaError::ElementNotFound(id.to_string()))?;
        if !entry.groups.contains(&group) {
            entry.groups.push(group);
            self.by_group.entry(group).or_default().push(id.clone());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ElementEntry> {
        self.entries.get(id)
    }

    /// 获取元素，不存在时返回 `ElementNotFound`
    pub fn require(&self, id: &str) -> Result<&ElementEntry> {
        self.get(id)
            .ok_or_else(|| PlayaError::ElementNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementEntry> {
        self.entries.values()
    }

    pub fn ids_of_kind(&self, kind: ElementKind) -> Vec<ElementId> {
        self.entries
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn members_of(&self, group: VisibilityGroup) -> &[ElementId] {
        self.by_group.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 克隆躺椅所属的行/区域分组
fn seat_groups(n: u32) -> &'static [VisibilityGroup] {
    use VisibilityGroup::*;
    match n {
        9..=12 => &[Row8],
        14 | 15 | 28 | 29 | 42 | 43 => &[FreeZone1],
        56 | 57 => &[Row4, FreeZone1],
        58..=68 => &[Row4],
        70 | 71 => &[Row3, FreeZone1],
        72..=82 => &[Row3],
        84 | 85 => &[Row2, FreeZone2],
        86..=96 => &[Row2],
        98 | 99 => &[Row1, FreeZone2],
        100..=110 => &[Row1],
        111 => &[Seat10A],
        112 | 113 => &[Row0, FreeZone2],
        114..=124 => &[Row0],
        125 => &[Seat0],
        _ => &[],
    }
}
