//! Gallery Store 集成测试

use gallery_live::feed::{ChangeSource, WorkspaceSource};
use gallery_live::*;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_store() -> (GalleryStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let store = GalleryStore::connect(StoreConfig::local(&db_path)).unwrap();
    (store, tmp)
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("test.db");

        // 目录不存在
        assert!(!db_path.parent().unwrap().exists());

        let _store = GalleryStore::connect(StoreConfig::local(&db_path)).unwrap();

        // 连接后文件应该存在
        assert!(db_path.exists());
    }

    #[test]
    fn test_reconnect_keeps_data_and_clock() {
        let (store, tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();
        let locked = store.lock_table(&table.id).unwrap();
        drop(store);

        let store = GalleryStore::connect(StoreConfig::local(tmp.path().join("test.db"))).unwrap();
        let tables = store.list_workspaces().unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables[0].is_locked);

        // 重连后的写入时间戳仍然大于已有记录
        let next = store.create_table("Loft").unwrap();
        let changes = store
            .changes_since(&ChangeQuery::new(locked.updated_at))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, next.id);
    }

    #[test]
    fn test_memory_store() {
        let store = GalleryStore::connect(StoreConfig::memory()).unwrap();
        store.create_table("Studio").unwrap();
        assert_eq!(store.list_workspaces().unwrap().len(), 1);
    }
}

// ==================== 桌子测试 ====================

mod table_tests {
    use super::*;

    #[test]
    fn test_create_and_list_tables() {
        let (store, _tmp) = setup_store();

        let a = store.create_table("Atrium").unwrap();
        let b = store.create_table("  Loft  ").unwrap();
        assert_eq!(b.name, "Loft");

        let tables = store.list_workspaces().unwrap();
        let ids: Vec<_> = tables.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
        assert!(tables.iter().all(|t| !t.is_locked && t.gallery.is_none()));
    }

    #[test]
    fn test_create_table_rejects_empty_name() {
        let (store, _tmp) = setup_store();
        let result = store.create_table("   ");
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_lock_table() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();

        let record = store.lock_table(&table.id).unwrap();
        assert_eq!(record.kind, ChangeKind::Table);
        assert_eq!(record.table_id, table.id);
        assert_eq!(record.data["isLocked"], true);

        let snapshot = store.get_table(&table.id).unwrap().unwrap();
        assert!(snapshot.is_locked);
    }

    #[test]
    fn test_lock_missing_table() {
        let (store, _tmp) = setup_store();
        let result = store.lock_table("missing");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}

// ==================== 图片测试 ====================

mod image_tests {
    use super::*;

    #[test]
    fn test_record_image_sets_gallery() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();

        let record = store
            .record_image(&table.id, "designer", "warm oak desks", "https://cdn/1.png")
            .unwrap();
        assert_eq!(record.kind, ChangeKind::Image);
        assert_eq!(record.data["personaId"], "designer");
        assert_eq!(record.data["url"], "https://cdn/1.png");

        let snapshot = store.get_table(&table.id).unwrap().unwrap();
        assert!(snapshot.has_gallery_image());
        assert_eq!(snapshot.gallery.unwrap().current_url, "https://cdn/1.png");
    }

    #[test]
    fn test_latest_image_wins() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();

        store.record_image(&table.id, "p", "first", "https://cdn/1.png").unwrap();
        store.record_image(&table.id, "p", "second", "https://cdn/2.png").unwrap();

        let snapshot = store.get_table(&table.id).unwrap().unwrap();
        assert_eq!(snapshot.gallery.unwrap().current_url, "https://cdn/2.png");
    }

    #[test]
    fn test_record_image_on_locked_table() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();
        store.lock_table(&table.id).unwrap();

        let result = store.record_image(&table.id, "p", "prompt", "https://cdn/1.png");
        assert!(matches!(result, Err(Error::Validation(_))));

        // 锁定的桌子保持没有展示图
        assert!(store.get_table(&table.id).unwrap().unwrap().gallery.is_none());
    }

    #[test]
    fn test_record_image_on_missing_table() {
        let (store, _tmp) = setup_store();
        let result = store.record_image("missing", "p", "prompt", "https://cdn/1.png");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}

// ==================== 增量读取测试 ====================

mod change_tests {
    use super::*;

    #[test]
    fn test_changes_since_zero_returns_everything_ascending() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();
        store.record_image(&table.id, "p", "a", "https://cdn/a.png").unwrap();

        let changes = store.changes_since(&ChangeQuery::new(0)).unwrap();

        // 1 张图片 + 1 张桌子（桌子因设置展示图被更新）
        assert_eq!(changes.len(), 2);
        assert!(changes.windows(2).all(|w| w[0].updated_at <= w[1].updated_at));
        assert_eq!(changes[0].kind, ChangeKind::Image);
        assert_eq!(changes[1].kind, ChangeKind::Table);
        assert_eq!(changes[1].data["gallery"]["currentUrl"], "https://cdn/a.png");
    }

    #[test]
    fn test_changes_since_is_strictly_after() {
        let (store, _tmp) = setup_store();
        let first = store.create_table("Atrium").unwrap();
        let locked = store.lock_table(&first.id).unwrap();

        assert!(store
            .changes_since(&ChangeQuery::new(locked.updated_at))
            .unwrap()
            .is_empty());

        let second = store.create_table("Loft").unwrap();
        let changes = store
            .changes_since(&ChangeQuery::new(locked.updated_at))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, second.id);
    }

    #[test]
    fn test_changes_limit_and_scope() {
        let (store, _tmp) = setup_store();
        let a = store.create_table("Atrium").unwrap();
        let b = store.create_table("Loft").unwrap();
        for i in 0..3 {
            store
                .record_image(&a.id, "p", "a", &format!("https://cdn/a{}.png", i))
                .unwrap();
        }
        store.record_image(&b.id, "p", "b", "https://cdn/b.png").unwrap();

        let limited = store
            .changes_since(&ChangeQuery::new(0).with_limit(2))
            .unwrap();
        assert_eq!(limited.len(), 2);

        let scoped = store
            .changes_since(&ChangeQuery::new(0).with_scope(Some(b.id.clone())))
            .unwrap();
        assert!(scoped.iter().all(|c| c.table_id == b.id));
        assert_eq!(scoped.len(), 2); // 一张图片 + 桌子本身

        // limit 为 0 按 1 处理
        let clamped = store
            .changes_since(&ChangeQuery::new(0).with_limit(0))
            .unwrap();
        assert_eq!(clamped.len(), 1);
    }

    #[test]
    fn test_single_record_pages_deliver_image_and_table() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();
        let created = store.changes_since(&ChangeQuery::new(0)).unwrap();
        let mut cursor = created[0].updated_at;

        let image = store
            .record_image(&table.id, "p", "a", "https://cdn/a.png")
            .unwrap();

        // 每页只取一条，游标推进到本页最后一条
        let mut delivered = Vec::new();
        loop {
            let page = store
                .changes_since(&ChangeQuery::new(cursor).with_limit(1))
                .unwrap();
            let Some(last) = page.last() else { break };
            cursor = last.updated_at;
            delivered.extend(page);
        }

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].id, image.id);
        assert_eq!(delivered[1].kind, ChangeKind::Table);
        assert_eq!(delivered[1].data["gallery"]["currentUrl"], "https://cdn/a.png");
        assert!(delivered[0].updated_at < delivered[1].updated_at);
    }

    #[tokio::test]
    async fn test_async_sources() {
        let (store, _tmp) = setup_store();
        let table = store.create_table("Atrium").unwrap();
        store.lock_table(&table.id).unwrap();

        let changes = ChangeSource::changes_since(&store, ChangeQuery::new(0))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);

        let workspaces = WorkspaceSource::list_workspaces(&store).await.unwrap();
        assert_eq!(workspaces.len(), 1);
        assert!(workspaces[0].is_locked);
    }
}
