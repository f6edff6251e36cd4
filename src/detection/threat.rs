//! 威胁类别表 (COCO class id → 威胁标签)
//!
//! 部分类别是代理: 遥控器/手机等 COCO 物体用来模拟手枪、步枪、扳机

use std::collections::BTreeMap;

use phf::phf_map;

/// COCO "person"
pub const PERSON_CLASS: u32 = 0;

static DEFAULT_THREATS: phf::Map<u32, &'static str> = phf_map! {
    43u32 => "Knife",
    76u32 => "Scissors",
    34u32 => "Baseball Bat",
    39u32 => "Glass Bottle",
    65u32 => "Handgun (Glock)",
    25u32 => "Rifle (AK47/M4)",
    67u32 => "Simulated Trigger",
};

/// 默认威胁表 (可在配置文件中覆盖)
pub fn default_threat_classes() -> BTreeMap<u32, String> {
    DEFAULT_THREATS
        .entries()
        .map(|(id, label)| (*id, label.to_string()))
        .collect()
}

/// 运行期威胁表
#[derive(Debug, Clone)]
pub struct ThreatTable {
    classes: BTreeMap<u32, String>,
}

impl ThreatTable {
    pub fn new(classes: BTreeMap<u32, String>) -> Self {
        Self { classes }
    }

    pub fn label(&self, class_id: u32) -> Option<&str> {
        self.classes.get(&class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for ThreatTable {
    fn default() -> Self {
        Self::new(default_threat_classes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = ThreatTable::default();
        assert_eq!(table.len(), 7);
        assert_eq!(table.label(43), Some("Knife"));
        assert_eq!(table.label(65), Some("Handgun (Glock)"));
        assert_eq!(table.label(PERSON_CLASS), None);
    }
}
