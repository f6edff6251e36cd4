//! 已知人脸库 (Known-Face Registry)
//!
//! 三个并列数组 (特征 / 姓名 / 关系) 由同一把锁保护, 下标一一对应:
//! - reload:  全量重建, 特征走磁盘缓存, 计算在锁外完成后整体替换
//! - add / remove / enroll: 增量修改
//! - match_face: 最近邻 + 距离阈值
//!
//! 检测线程 (自动登记) 和管理接口 (增删人员) 会并发修改, 所有读写都串行化。

pub mod cache;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::detection::adapter::{Embedding, FaceRecognizer};
use crate::store::{PersonRecord, PersonStore};

pub use cache::EmbeddingCache;

const PHOTO_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 并列数组, 长度始终相等
#[derive(Default, Debug, Clone)]
struct FaceTable {
    embeddings: Vec<Embedding>,
    names: Vec<String>,
    relations: Vec<String>,
}

impl FaceTable {
    fn push(&mut self, embedding: Embedding, name: &str, relation: &str) {
        self.embeddings.push(embedding);
        self.names.push(name.to_string());
        self.relations.push(relation.to_string());
    }

    /// 倒序删除同名条目, 保持下标对齐
    fn remove_name(&mut self, name: &str) -> usize {
        let indices: Vec<usize> = self
            .names
            .iter()
            .enumerate()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(i, _)| i)
            .collect();
        for &i in indices.iter().rev() {
            self.embeddings.remove(i);
            self.names.remove(i);
            self.relations.remove(i);
        }
        indices.len()
    }

    fn len(&self) -> usize {
        debug_assert!(self.embeddings.len() == self.names.len() && self.names.len() == self.relations.len());
        self.names.len()
    }
}

pub struct KnownFaceRegistry {
    recognizer: Arc<dyn FaceRecognizer>,
    media_root: PathBuf,
    tolerance: f32,
    table: Mutex<FaceTable>,
    cache: Mutex<EmbeddingCache>,
}

impl KnownFaceRegistry {
    pub fn new(
        recognizer: Arc<dyn FaceRecognizer>,
        media_root: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        tolerance: f32,
    ) -> Self {
        Self {
            recognizer,
            media_root: media_root.into(),
            tolerance,
            table: Mutex::new(FaceTable::default()),
            cache: Mutex::new(EmbeddingCache::load(cache_path)),
        }
    }

    fn table(&self) -> MutexGuard<'_, FaceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, EmbeddingCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前所有 (姓名, 关系), 按下标顺序
    pub fn entries(&self) -> Vec<(String, String)> {
        let table = self.table();
        table.names.iter().cloned().zip(table.relations.iter().cloned()).collect()
    }

    /// 人员照片: 照片目录优先, 目录里一张可用特征都没有才用旧版单张照片
    fn photo_candidates(&self, photo_dir: Option<&str>) -> Vec<PathBuf> {
        let Some(dir) = photo_dir.filter(|d| !d.is_empty()) else {
            return Vec::new();
        };
        let dir = self.media_root.join(dir);
        let Ok(read) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| PHOTO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    /// 单张图片 → 特征 (命中缓存直接返回)
    fn embed_file(&self, cache: &mut EmbeddingCache, path: &Path, used: &mut HashSet<String>) -> Option<Embedding> {
        let key = cache::cache_key(path);
        if let Some(hit) = cache.get(&key) {
            used.insert(key);
            return Some(hit.clone());
        }
        if !path.exists() {
            return None;
        }
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!("⚠️  无法读取照片 {}: {}", path.display(), e);
                return None;
            }
        };
        match self.recognizer.embed(&image) {
            Ok(Some(embedding)) => {
                cache.insert(key.clone(), embedding.clone());
                used.insert(key);
                Some(embedding)
            }
            Ok(None) => {
                tracing::debug!("照片中未检测到人脸: {}", path.display());
                None
            }
            Err(e) => {
                tracing::warn!("⚠️  特征提取失败 {}: {:#}", path.display(), e);
                None
            }
        }
    }

    fn person_embeddings(
        &self,
        cache: &mut EmbeddingCache,
        photo_dir: Option<&str>,
        photo_path: Option<&str>,
        used: &mut HashSet<String>,
    ) -> Vec<Embedding> {
        let mut found: Vec<Embedding> = self
            .photo_candidates(photo_dir)
            .iter()
            .filter_map(|p| self.embed_file(cache, p, used))
            .collect();
        if found.is_empty() {
            if let Some(photo) = photo_path.filter(|p| !p.is_empty()) {
                let path = self.media_root.join(photo);
                found.extend(self.embed_file(cache, &path, used));
            }
        }
        found
    }

    /// 从人员库全量重建; 缓存只保留本次用到的图片
    pub fn reload(&self, store: &dyn PersonStore) -> Result<usize> {
        tracing::info!("🔍 加载已知人脸...");
        let persons = store.list_persons()?;

        let mut fresh = FaceTable::default();
        let mut used = HashSet::new();
        {
            let mut cache = self.cache();
            for person in &persons {
                for embedding in self.person_embeddings(
                    &mut cache,
                    person.photo_dir.as_deref(),
                    person.photo_path.as_deref(),
                    &mut used,
                ) {
                    fresh.push(embedding, &person.name, &person.relation);
                }
            }
            cache.retain_keys(&used);
            if let Err(e) = cache.save() {
                tracing::warn!("⚠️  特征缓存保存失败: {:#}", e);
            }
        }

        let count = fresh.len();
        *self.table() = fresh;
        tracing::info!("✅ 已加载 {} 张人脸 ({} 人)", count, persons.len());
        Ok(count)
    }

    /// 计算单个人员的特征 (不持有人脸库锁)
    fn embeddings_for(&self, photo_dir: Option<&str>, photo_path: Option<&str>) -> Vec<Embedding> {
        let mut used = HashSet::new();
        let mut cache = self.cache();
        let found = self.person_embeddings(&mut cache, photo_dir, photo_path, &mut used);
        if let Err(e) = cache.save() {
            tracing::warn!("⚠️  特征缓存保存失败: {:#}", e);
        }
        found
    }

    /// 增量添加; 没有可用照片时只告警, 返回 0
    pub fn add_person(&self, name: &str, relation: &str, photo_dir: Option<&str>, photo_path: Option<&str>) -> usize {
        let found = self.embeddings_for(photo_dir, photo_path);
        if found.is_empty() {
            tracing::warn!("⚠️  {} 没有可识别的人脸照片, 未加入人脸库", name);
            return 0;
        }

        let count = found.len();
        let mut table = self.table();
        for embedding in found {
            table.push(embedding, name, relation);
        }
        tracing::info!("✅ 增量添加 {} ({}): {} 张人脸", name, relation, count);
        count
    }

    pub fn add_record(&self, person: &PersonRecord) -> usize {
        self.add_person(
            &person.name,
            &person.relation,
            person.photo_dir.as_deref(),
            person.photo_path.as_deref(),
        )
    }

    /// 删除所有同名条目, 返回删除数量
    pub fn remove_person(&self, name: &str) -> usize {
        let removed = self.table().remove_name(name);
        if removed > 0 {
            tracing::info!("🗑️  从人脸库移除 {}: {} 条", name, removed);
        }
        removed
    }

    /// 用新记录替换 `old_name` 的全部条目
    ///
    /// 特征先在锁外算好, 删除和追加在同一次加锁内完成, 检测线程看不到中间状态
    pub fn replace_person(&self, old_name: &str, person: &PersonRecord) -> usize {
        let found = self.embeddings_for(person.photo_dir.as_deref(), person.photo_path.as_deref());
        let count = found.len();

        let mut table = self.table();
        let removed = table.remove_name(old_name);
        for embedding in found {
            table.push(embedding, &person.name, &person.relation);
        }
        drop(table);

        if count == 0 {
            tracing::warn!("⚠️  {} 没有可识别的人脸照片, 已移出人脸库", person.name);
        }
        tracing::info!("🔄 更新 {} → {} ({}): 移除 {} 条, 加入 {} 张人脸", old_name, person.name, person.relation, removed, count);
        count
    }

    /// 直接追加特征 (自动登记, 不经过 reload)
    pub fn enroll(&self, embedding: Embedding, name: &str, relation: &str) {
        self.table().push(embedding, name, relation);
    }

    /// 最近邻匹配: 最小距离 <= tolerance 才接受, 距离相同取下标靠前者
    pub fn match_face(&self, probe: &Embedding) -> Option<(String, String)> {
        self.match_with_tolerance(probe, self.tolerance)
    }

    pub fn match_with_tolerance(&self, probe: &Embedding, tolerance: f32) -> Option<(String, String)> {
        let table = self.table();
        let mut best: Option<(usize, f32)> = None;
        for (i, known) in table.embeddings.iter().enumerate() {
            let d = known.distance(probe);
            match best {
                Some((_, bd)) if d >= bd => {}
                _ => best = Some((i, d)),
            }
        }
        let (index, distance) = best?;
        if distance <= tolerance {
            Some((table.names[index].clone(), table.relations[index].clone()))
        } else {
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::types::BBox;
    use crate::store::MemoryStore;
    use chrono::Local;
    use image::{Rgb, RgbImage};

    /// 测试用识别器: 整张图就是一张脸, 特征 = 左上角像素 RGB / 255
    pub(crate) struct ColorRecognizer;

    impl FaceRecognizer for ColorRecognizer {
        fn locate_faces(&self, image: &RgbImage) -> Result<Vec<BBox>> {
            if image.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![BBox::new(0.0, 0.0, image.width() as f32, image.height() as f32)])
        }

        fn embed_faces(&self, image: &RgbImage, faces: &[BBox]) -> Result<Vec<Embedding>> {
            Ok(faces
                .iter()
                .map(|f| {
                    let x = (f.x1 as u32).min(image.width() - 1);
                    let y = (f.y1 as u32).min(image.height() - 1);
                    let p = image.get_pixel(x, y).0;
                    Embedding::new(p.iter().map(|v| *v as f32 / 255.0).collect())
                })
                .collect())
        }
    }

    fn save_face(path: &Path, rgb: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(8, 8, Rgb(rgb)).save(path).unwrap();
    }

    fn person(name: &str, relation: &str, dir: Option<&str>, photo: Option<&str>) -> PersonRecord {
        PersonRecord {
            id: String::new(),
            serial_no: 1,
            name: name.to_string(),
            relation: relation.to_string(),
            phone: String::new(),
            address: String::new(),
            photo_path: photo.map(str::to_string),
            photo_dir: dir.map(str::to_string),
            created_at: Local::now(),
        }
    }

    fn registry(root: &Path) -> KnownFaceRegistry {
        KnownFaceRegistry::new(Arc::new(ColorRecognizer), root, root.join("cache.json"), 0.55)
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.match_face(&Embedding::new(vec![0.1, 0.2, 0.3])), None);
    }

    #[test]
    fn test_match_within_and_beyond_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.enroll(Embedding::new(vec![0.0, 0.0, 0.0]), "Alice", "Family");

        // 距离 0.2
        assert_eq!(
            reg.match_face(&Embedding::new(vec![0.2, 0.0, 0.0])),
            Some(("Alice".to_string(), "Family".to_string()))
        );
        assert_eq!(reg.len(), 1);
        // 距离 0.9
        assert_eq!(reg.match_face(&Embedding::new(vec![0.9, 0.0, 0.0])), None);
    }

    #[test]
    fn test_tie_takes_first_index() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.enroll(Embedding::new(vec![0.1, 0.0, 0.0]), "First", "Family");
        reg.enroll(Embedding::new(vec![-0.1, 0.0, 0.0]), "Second", "Friend");
        assert_eq!(
            reg.match_face(&Embedding::new(vec![0.0, 0.0, 0.0])).map(|m| m.0),
            Some("First".to_string())
        );
    }

    #[test]
    fn test_remove_person_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.enroll(Embedding::new(vec![0.0, 0.0, 0.0]), "Bob", "Friend");
        reg.enroll(Embedding::new(vec![1.0, 1.0, 1.0]), "Alice", "Family");
        reg.enroll(Embedding::new(vec![0.0, 0.1, 0.0]), "Bob", "Friend");

        assert_eq!(reg.remove_person("Bob"), 2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.entries(), vec![("Alice".to_string(), "Family".to_string())]);
        assert_eq!(reg.match_face(&Embedding::new(vec![0.0, 0.0, 0.0])), None);
        assert_eq!(reg.remove_person("Bob"), 0);
    }

    #[test]
    fn test_reload_prefers_directory_and_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        save_face(&root.join("known/alice/1.jpg"), [200, 10, 10]);
        save_face(&root.join("known/alice/2.png"), [10, 200, 10]);
        save_face(&root.join("known/alice_legacy.jpg"), [10, 10, 200]);
        // 目录为空 → 回退到单张照片
        fs::create_dir_all(root.join("known/bob")).unwrap();
        save_face(&root.join("known/bob.jpg"), [100, 100, 100]);

        let store = MemoryStore::new();
        PersonStore::insert(&store, person("Alice", "Family", Some("known/alice"), Some("known/alice_legacy.jpg")))
            .unwrap();
        PersonStore::insert(&store, person("Bob", "Friend", Some("known/bob"), Some("known/bob.jpg"))).unwrap();

        let reg = registry(root);
        assert_eq!(reg.reload(&store).unwrap(), 3);
        assert_eq!(reg.entries().iter().filter(|(n, _)| n == "Alice").count(), 2);
        assert_eq!(reg.cache().len(), 3);

        // 缓存命中: 删除原图后仍可重建
        fs::remove_file(root.join("known/bob.jpg")).unwrap();
        let again = registry(root);
        assert!(root.join("cache.json").exists());
        assert_eq!(again.reload(&store).unwrap(), 3);

        // 删除人员后缓存被裁剪
        let bob = store.find_by_serial_or_name(None, Some("Bob")).unwrap().unwrap();
        store.delete(&bob.id).unwrap();
        assert_eq!(again.reload(&store).unwrap(), 2);
        assert_eq!(again.cache().len(), 2);
    }

    #[test]
    fn test_add_person_without_photos_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.add_person("Ghost", "Friend", Some("known/ghost"), Some("missing.jpg")), 0);
        assert!(reg.is_empty());

        save_face(&dir.path().join("known/carol/a.jpg"), [50, 60, 70]);
        assert_eq!(reg.add_person("Carol", "Neighbor", Some("known/carol"), None), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_replace_person_swaps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        save_face(&root.join("known/dave/1.jpg"), [200, 200, 200]);
        save_face(&root.join("known/dave/2.jpg"), [190, 190, 190]);

        let reg = registry(root);
        reg.enroll(Embedding::new(vec![0.1, 0.1, 0.1]), "Dave", "Friend");
        reg.enroll(Embedding::new(vec![1.0, 0.0, 0.0]), "Erin", "Family");

        let record = person("David", "Suspect", Some("known/dave"), None);
        assert_eq!(reg.replace_person("Dave", &record), 2);
        assert_eq!(reg.len(), 3);
        assert!(reg.entries().iter().all(|(n, _)| n != "Dave"));
        assert_eq!(
            reg.match_face(&Embedding::new(vec![0.78, 0.78, 0.78])),
            Some(("David".to_string(), "Suspect".to_string()))
        );

        // 新照片不可用: 旧条目照样移除
        let ghost = person("Erin", "Family", Some("known/none"), None);
        assert_eq!(reg.replace_person("Erin", &ghost), 0);
        assert_eq!(reg.len(), 2);
    }
}
