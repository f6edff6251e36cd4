//! 人脸特征磁盘缓存 (绝对路径 → 特征向量)

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::detection::adapter::Embedding;

pub struct EmbeddingCache {
    path: PathBuf,
    entries: HashMap<String, Embedding>,
    dirty: bool,
}

/// 缓存键: 绝对路径
pub fn cache_key(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.to_string_lossy().into_owned()
}

impl EmbeddingCache {
    /// 加载缓存; 文件缺失或损坏都当作空缓存
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️  特征缓存 {} 损坏 ({}), 重新计算", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Embedding> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, embedding: Embedding) {
        self.entries.insert(key, embedding);
        self.dirty = true;
    }

    /// 只保留本次用到的路径
    pub fn retain_keys(&mut self, used: &HashSet<String>) {
        let before = self.entries.len();
        self.entries.retain(|k, _| used.contains(k));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    /// 有变化才写盘
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&self.entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}
