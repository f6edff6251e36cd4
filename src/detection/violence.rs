//! 打架检测: 两两比较人体框, 重叠过大视为肢体冲突

use super::types::BBox;

/// 返回每一对 IoU 超过阈值的人体框的外接框
pub fn violent_pairs(persons: &[BBox], iou_threshold: f32) -> Vec<BBox> {
    let mut hits = Vec::new();
    if persons.len() < 2 {
        return hits;
    }
    for i in 0..persons.len() {
        for j in (i + 1)..persons.len() {
            if persons[i].iou(&persons[j]) > iou_threshold {
                hits.push(persons[i].union(&persons[j]));
            }
        }
    }
    hits
}
