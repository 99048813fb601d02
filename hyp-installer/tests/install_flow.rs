//! End-to-end pipeline tests against a mock metadata service and CDN

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use hyp_download::RateLimiter;
use hyp_installer::{
    InstallManager, InstallOperation, InstallPhase, InstallRequest, InstallService, InstallTask,
};
use hyp_manifest::{GameVariant, MetadataClient, Region};
use hyp_unpack::HpatchTool;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

fn variant() -> GameVariant {
    GameVariant::new("hk4e", Region::Global)
}

fn envelope(data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"retcode": 0, "message": "OK", "data": data})
}

fn not_found_envelope() -> serde_json::Value {
    serde_json::json!({"retcode": -202, "message": "not found", "data": null})
}

async fn mount_json(server: &MockServer, endpoint: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Endpoints every finishing run touches
async fn mount_finish_endpoints(server: &MockServer) {
    mount_json(server, "/api/channel_sdk", not_found_envelope()).await;
    mount_json(
        server,
        "/api/deprecated_files",
        envelope(serde_json::json!({"deprecated_files": []})),
    )
    .await;
}

async fn mount_package_profile(server: &MockServer) {
    mount_json(
        server,
        "/api/profile",
        envelope(serde_json::json!({
            "default_download_mode": "DOWNLOAD_MODE_FILE",
            "hard_link_eligible": false
        })),
    )
    .await;
}

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap();
    cursor.into_inner()
}

fn service(server: &MockServer, hpatch: HpatchTool) -> InstallService {
    let client = MetadataClient::new(server.uri()).unwrap();
    InstallService::new(client, Arc::new(RateLimiter::unlimited()), hpatch).unwrap()
}

fn package_manifest(server: &MockServer, archive: &[u8], patch: Option<&[u8]>) -> serde_json::Value {
    let mut main = serde_json::json!({
        "major": {
            "version": "1.1.0",
            "game_pkgs": [{
                "url": format!("{}/cdn/game_1.1.0.zip", server.uri()),
                "size": archive.len(),
                "md5": md5_hex(archive),
            }],
            "audio_pkgs": [],
            "res_list_url": format!("{}/res", server.uri()),
        },
        "patches": []
    });
    if let Some(patch) = patch {
        main["patches"] = serde_json::json!([{
            "version": "1.0.0",
            "game_pkgs": [{
                "url": format!("{}/cdn/patch_1.0.0_1.1.0.zip", server.uri()),
                "size": patch.len(),
                "md5": md5_hex(patch),
            }],
            "audio_pkgs": []
        }]);
    }
    envelope(serde_json::json!({"main": main}))
}

fn assert_no_leftovers(root: &Path) {
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with("_tmp"), "leftover temp file: {name}");
        assert!(!name.ends_with(".hdiff"), "leftover diff file: {name}");
    }
}

#[tokio::test]
async fn package_install_end_to_end() {
    let server = MockServer::start().await;
    let archive = build_zip(&[
        ("GameAssembly.dll", b"assembly-bytes".as_slice()),
        ("data/blocks.bin", b"block-bytes".as_slice()),
    ]);
    mount_package_profile(&server).await;
    mount_json(&server, "/api/package", package_manifest(&server, &archive, None)).await;
    mount_finish_endpoints(&server).await;
    Mock::given(method("GET"))
        .and(path("/cdn/game_1.1.0.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let service = service(&server, HpatchTool::from_path());
    let mut task = InstallTask::new(InstallRequest::new(
        variant(),
        &root,
        InstallOperation::Install,
    ));
    service.run(&mut task).await.unwrap();

    assert_eq!(task.handle.phase(), InstallPhase::Finish);
    assert_eq!(
        std::fs::read(root.join("GameAssembly.dll")).unwrap(),
        b"assembly-bytes"
    );
    assert_eq!(
        std::fs::read(root.join("data/blocks.bin")).unwrap(),
        b"block-bytes"
    );
    // The consumed archive is gone, the version marker is written
    assert!(!root.join("game_1.1.0.zip").exists());
    let marker = std::fs::read_to_string(root.join("config.ini")).unwrap();
    assert!(marker.contains("game_version=1.1.0"));
    assert!(marker.contains("game_biz=hk4e_global"));
    assert!(marker.contains("channel=1"));
    assert_no_leftovers(&root);
}

#[cfg(unix)]
#[tokio::test]
async fn update_with_patch_set_end_to_end() {
    use std::os::unix::fs::PermissionsExt;

    let server = MockServer::start().await;
    // The patch archive drops a new file, a deletion list naming
    // `old.dat`, and an hdiff for `core.dat`
    let patch = build_zip(&[
        ("newfile.dat", b"added-in-1.1.0".as_slice()),
        ("deletefiles.txt", b"old.dat\n".as_slice()),
        (
            "hdifffiles.txt",
            br#"{"remoteName": "core.dat"}"#.as_slice(),
        ),
        ("core.dat.hdiff", b"core-v1.1.0-bytes".as_slice()),
    ]);
    let full = build_zip(&[("unused.bin", b"x".as_slice())]);
    mount_package_profile(&server).await;
    mount_json(
        &server,
        "/api/package",
        package_manifest(&server, &full, Some(&patch)),
    )
    .await;
    mount_finish_endpoints(&server).await;
    Mock::given(method("GET"))
        .and(path("/cdn/patch_1.0.0_1.1.0.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(patch.clone()))
        .mount(&server)
        .await;

    // Local 1.0.0 install with the files the patch touches
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("config.ini"), "[General]\ngame_version=1.0.0\n").unwrap();
    std::fs::write(root.join("old.dat"), b"obsolete").unwrap();
    std::fs::write(root.join("core.dat"), b"core-v1.0.0-bytes").unwrap();

    // Stub merge tool: the diff bytes are the new file content
    let tool_path = dir.path().join("hpatchz-stub");
    std::fs::write(&tool_path, "#!/bin/sh\ncp \"$3\" \"$4\"\n").unwrap();
    std::fs::set_permissions(&tool_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let service = service(&server, HpatchTool::new(&tool_path));
    let mut task = InstallTask::new(InstallRequest::new(
        variant(),
        &root,
        InstallOperation::Update,
    ));
    service.run(&mut task).await.unwrap();

    assert_eq!(task.handle.phase(), InstallPhase::Finish);
    assert!(!root.join("old.dat").exists());
    assert_eq!(
        std::fs::read(root.join("core.dat")).unwrap(),
        b"core-v1.1.0-bytes"
    );
    assert_eq!(
        std::fs::read(root.join("newfile.dat")).unwrap(),
        b"added-in-1.1.0"
    );
    let marker = std::fs::read_to_string(root.join("config.ini")).unwrap();
    assert!(marker.contains("game_version=1.1.0"));
    assert_no_leftovers(&root);
}

#[tokio::test]
async fn predownload_without_branch_is_already_latest() {
    let server = MockServer::start().await;
    let archive = build_zip(&[("a.bin", b"x".as_slice())]);
    mount_package_profile(&server).await;
    mount_json(&server, "/api/package", package_manifest(&server, &archive, None)).await;
    mount_finish_endpoints(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("config.ini"), "[General]\ngame_version=1.1.0\n").unwrap();

    let service = service(&server, HpatchTool::from_path());
    let mut task = InstallTask::new(InstallRequest::new(
        variant(),
        &root,
        InstallOperation::Predownload,
    ));
    let err = service.run(&mut task).await.unwrap_err();
    assert!(matches!(err, hyp_installer::Error::AlreadyLatestVersion));
    assert_eq!(task.handle.phase(), InstallPhase::Error);
    assert!(task.handle.status().error.is_some());
}

#[tokio::test]
async fn repair_fixes_corrupt_files_and_prunes_extraneous_ones() {
    let server = MockServer::start().await;
    let archive = build_zip(&[("unused.bin", b"x".as_slice())]);
    mount_package_profile(&server).await;
    mount_json(&server, "/api/package", package_manifest(&server, &archive, None)).await;
    mount_finish_endpoints(&server).await;

    let listing = concat!(
        r#"{"remoteName": "good.bin", "md5": "9d8df8c188f03ec37fbedfd5eb335fa1", "fileSize": 10}"#,
        "\n",
        r#"{"remoteName": "data/bad.bin", "md5": "9979da7aac70358890437509491ff754", "fileSize": 11}"#,
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/res/pkg_version"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(listing.as_bytes().to_vec()))
        .mount(&server)
        .await;
    // Only the corrupt file may be fetched; `good.bin` has no mock and
    // fetching it would fail the run
    Mock::given(method("GET"))
        .and(path("/res/data/bad.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh-bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    std::fs::create_dir_all(root.join("data")).unwrap();
    std::fs::write(root.join("config.ini"), "[General]\ngame_version=1.1.0\n").unwrap();
    std::fs::write(root.join("good.bin"), b"good-bytes").unwrap();
    std::fs::write(root.join("data/bad.bin"), b"corrupted!!").unwrap();
    std::fs::write(root.join("extraneous.bin"), b"not-in-listing").unwrap();

    let service = service(&server, HpatchTool::from_path());
    let mut task = InstallTask::new(InstallRequest::new(
        variant(),
        &root,
        InstallOperation::Repair,
    ));
    service.run(&mut task).await.unwrap();

    assert_eq!(task.handle.phase(), InstallPhase::Finish);
    assert_eq!(std::fs::read(root.join("good.bin")).unwrap(), b"good-bytes");
    assert_eq!(
        std::fs::read(root.join("data/bad.bin")).unwrap(),
        b"fresh-bytes"
    );
    assert!(!root.join("extraneous.bin").exists());
    assert_no_leftovers(&root);
}

#[tokio::test]
async fn chunk_install_end_to_end() {
    let server = MockServer::start().await;
    mount_json(
        &server,
        "/api/profile",
        envelope(serde_json::json!({
            "default_download_mode": "DOWNLOAD_MODE_CHUNK",
            "hard_link_eligible": false
        })),
    )
    .await;
    mount_finish_endpoints(&server).await;

    // One category with one file assembled from two chunks
    let part1 = b"first-part-".as_slice();
    let part2 = b"second-part".as_slice();
    let full = b"first-part-second-part";
    let comp1 = zstd::stream::encode_all(Cursor::new(part1), 0).unwrap();
    let comp2 = zstd::stream::encode_all(Cursor::new(part2), 0).unwrap();

    let index = serde_json::json!({
        "files": [{
            "name": "data/blocks.bin",
            "size": full.len(),
            "md5": md5_hex(full),
            "chunks": [
                {
                    "id": "c1", "offset": 0,
                    "compressed_size": comp1.len(), "uncompressed_size": part1.len(),
                    "compressed_md5": md5_hex(&comp1), "uncompressed_md5": md5_hex(part1)
                },
                {
                    "id": "c2", "offset": part1.len(),
                    "compressed_size": comp2.len(), "uncompressed_size": part2.len(),
                    "compressed_md5": md5_hex(&comp2), "uncompressed_md5": md5_hex(part2)
                }
            ]
        }]
    });
    let index_payload = serde_json::to_vec(&index).unwrap();
    let index_compressed = zstd::stream::encode_all(Cursor::new(&index_payload[..]), 0).unwrap();

    Mock::given(method("GET"))
        .and(path("/api/chunk_build"))
        .and(query_param("tag", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(serde_json::json!({
            "build_id": "b100",
            "tag": "1.1.0",
            "manifests": [{
                "matching_field": "game",
                "manifest": {
                    "id": "idx1",
                    "checksum": md5_hex(&index_payload),
                    "compressed_size": index_compressed.len(),
                    "uncompressed_size": index_payload.len()
                },
                "manifest_download": {"url_prefix": format!("{}/manifests", server.uri())},
                "chunk_download": {"url_prefix": format!("{}/chunks", server.uri())},
                "stats": {"compressed_size": 0, "uncompressed_size": 0, "file_count": 1, "chunk_count": 2},
                "deduplicated_stats": {"compressed_size": 0, "uncompressed_size": 0, "file_count": 1, "chunk_count": 2}
            }]
        }))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/manifests/idx1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(index_compressed.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chunks/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(comp1.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chunks/c2"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(comp2.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let service = service(&server, HpatchTool::from_path());
    let mut task = InstallTask::new(InstallRequest::new(
        variant(),
        &root,
        InstallOperation::Install,
    ));
    service.run(&mut task).await.unwrap();

    assert_eq!(task.handle.phase(), InstallPhase::Finish);
    assert_eq!(std::fs::read(root.join("data/blocks.bin")).unwrap(), full);
    let marker = std::fs::read_to_string(root.join("config.ini")).unwrap();
    assert!(marker.contains("game_version=1.1.0"));
    assert_no_leftovers(&root);
}

#[tokio::test]
async fn pause_and_continue_reuses_the_plan() {
    let server = MockServer::start().await;
    let archive = build_zip(&[("a.bin", b"archive-member-content".as_slice())]);
    mount_package_profile(&server).await;
    mount_finish_endpoints(&server).await;
    // Planning happens exactly once across the pause/continue cycle
    Mock::given(method("GET"))
        .and(path("/api/package"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(package_manifest(&server, &archive, None)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/game_1.1.0.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(archive.clone())
                .set_delay(std::time::Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("install");
    let client = MetadataClient::new(server.uri()).unwrap();
    let service =
        InstallService::new(client, Arc::new(RateLimiter::unlimited()), HpatchTool::from_path())
            .unwrap();
    let manager = InstallManager::new(service);

    let request = InstallRequest::new(variant(), &root, InstallOperation::Install);
    let handle = manager.start_or_continue(request.clone());

    // Wait until the task reaches the download phase, then pause
    for _ in 0..300 {
        if handle.phase() == InstallPhase::Download {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(handle.phase(), InstallPhase::Download);
    manager.pause(&variant()).unwrap();
    for _ in 0..300 {
        if handle.phase() == InstallPhase::None && !manager.is_active(&variant()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(handle.phase(), InstallPhase::None);
    assert!(!manager.is_active(&variant()));

    // Continue: prepare is skipped, the run completes
    let handle = manager.start_or_continue(request);
    for _ in 0..600 {
        if handle.phase() == InstallPhase::Finish {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(handle.phase(), InstallPhase::Finish);
    assert_eq!(
        std::fs::read(root.join("a.bin")).unwrap(),
        b"archive-member-content"
    );
}
