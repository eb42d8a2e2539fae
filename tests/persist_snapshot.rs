//! 状态持久化集成测试：进程装配、落盘、重启后恢复

use vea::app::App;
use vea::common::VeaErrorKind;
use vea::config::{Paths, SupervisorOptions};
use vea::domain::{Node, NodeProtocol, ServiceState, SCHEMA_VERSION};

fn paths_in(dir: &std::path::Path) -> Paths {
    Paths::with_roots(dir.join("artifacts"), dir.join("data"))
}

fn read_state(paths: &Paths) -> ServiceState {
    let bytes = std::fs::read(&paths.state_file).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn fresh_install_persists_defaults_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    let app = App::bootstrap(paths.clone(), SupervisorOptions::default())
        .await
        .unwrap();
    let node = app
        .facade
        .create_node(Node::new("hk-1", "hk.example.com", 443, NodeProtocol::Trojan))
        .await
        .unwrap();
    app.shutdown().await;

    let saved = read_state(&paths);
    assert_eq!(saved.schema_version, SCHEMA_VERSION);
    assert_eq!(saved.components.len(), 3);
    assert_eq!(saved.frouters.len(), 1);
    assert_eq!(saved.proxy_config.frouter_id, saved.frouters[0].id);
    assert!(saved.nodes.iter().any(|n| n.id == node.id));

    // 再次启动不应重复创建默认数据
    let app = App::bootstrap(paths.clone(), SupervisorOptions::default())
        .await
        .unwrap();
    let snapshot = app.facade.snapshot().await;
    assert_eq!(snapshot.components.len(), 3);
    assert_eq!(snapshot.frouters.len(), 1);
    assert_eq!(app.facade.get_node(&node.id).await.unwrap().name, "hk-1");
    app.shutdown().await;
}

#[tokio::test]
async fn corrupt_state_aborts_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::create_dir_all(paths.state_file.parent().unwrap()).unwrap();
    std::fs::write(&paths.state_file, b"{\"schemaVersion\": \"2.1.0\", \"nodes\": [").unwrap();

    let err = App::bootstrap(paths.clone(), SupervisorOptions::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), VeaErrorKind::PersistLoadCorrupt);
    // 损坏的文件原样保留，方便手工修复
    assert!(std::fs::read(&paths.state_file)
        .unwrap()
        .starts_with(b"{\"schemaVersion\""));
}

#[tokio::test]
async fn legacy_embedded_nodes_are_hoisted() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::create_dir_all(paths.state_file.parent().unwrap()).unwrap();
    let legacy = serde_json::json!({
        "schemaVersion": "2.0.0",
        "frouters": [{
            "id": "fr-1",
            "name": "旧路由",
            "sourceConfigId": "sub-1",
            "nodes": [{
                "id": "n-1",
                "name": "jp",
                "address": "jp.example.com",
                "port": 443,
                "protocol": "trojan"
            }]
        }],
        "generatedAt": "2024-05-01T00:00:00Z"
    });
    std::fs::write(&paths.state_file, serde_json::to_vec(&legacy).unwrap()).unwrap();

    let app = App::bootstrap(paths.clone(), SupervisorOptions::default())
        .await
        .unwrap();
    let node = app.facade.get_node("n-1").await.unwrap();
    assert_eq!(node.source_config_id, "sub-1");
    assert_eq!(app.facade.list_frouters().await.len(), 1);
    app.shutdown().await;

    assert_eq!(read_state(&paths).schema_version, SCHEMA_VERSION);
}
