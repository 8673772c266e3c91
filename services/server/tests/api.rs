//! End-to-end API flows: intake validation, deduplication, provisioning
//! acknowledgements, signed uploads, and downloads.

use std::io::Write;

use imageforge_distro::Distributions;
use imageforge_server::{api, config::Config, seed, state::AppState};
use imageforge_signing::Keypair;
use imageforge_store::{Database, Profile, RequestStatus, SubtargetKey};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct TestServer {
    base_url: String,
    db: Database,
    #[allow(dead_code)]
    dirs: TempDir,
    client: reqwest::Client,
}

fn key() -> SubtargetKey {
    SubtargetKey::new("lede", "17.01.4", "ar71xx", "generic")
}

const DISTRIBUTIONS: &str = r#"
default = "lede"
imagebuilder_prefix = "lede"
imagebuilder_url = "https://downloads.example.org/releases"

[distros.lede]
latest = "17.01.4"

[distros.lede.targets]
ar71xx = ["generic"]
"#;

async fn spawn_server() -> TestServer {
    let dirs = tempfile::tempdir().unwrap();
    let download_dir = dirs.path().join("download");
    let temp_dir = dirs.path().join("tmp");
    let network_profiles_dir = dirs.path().join("network_profiles");
    std::fs::create_dir_all(download_dir.join("faillogs")).unwrap();
    std::fs::create_dir_all(&temp_dir).unwrap();
    std::fs::create_dir_all(network_profiles_dir.join("office")).unwrap();

    let distributions = Distributions::from_toml(DISTRIBUTIONS).unwrap();
    let db = Database::connect_in_memory().await.unwrap();
    seed::seed_subtargets(&db, &distributions).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let config = Config {
        listen_addr: addr,
        server_url: base_url.clone(),
        database_url: "sqlite::memory:".to_string(),
        download_dir,
        temp_dir,
        network_profiles_dir,
        distributions_file: "distributions.toml".into(),
        log_level: "info".to_string(),
    };

    let state = AppState::new(db.clone(), config, distributions);
    let app = api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url,
        db,
        dirs,
        client: reqwest::Client::new(),
    }
}

/// Populate profiles and a fresh package catalogue so intake gets past
/// provisioning.
async fn provision_subtarget(db: &Database) {
    db.packages()
        .insert_profiles(
            &key(),
            &["base-files".to_string(), "busybox".to_string()],
            &[Profile {
                name: "tl-wdr4300-v1".to_string(),
                model: "TP-Link TL-WDR4300 v1".to_string(),
                packages: vec![],
            }],
        )
        .await
        .unwrap();
    db.packages()
        .insert_packages_available(
            &key(),
            &[
                ("luci".to_string(), "git-17.230".to_string()),
                ("nano".to_string(), "2.7.5-1".to_string()),
            ],
        )
        .await
        .unwrap();
}

fn build_request_body() -> serde_json::Value {
    serde_json::json!({
        "distro": "lede",
        "version": "17.01.4",
        "target": "ar71xx",
        "subtarget": "generic",
        "profile": "tl-wdr4300-v1",
        "packages": ["luci", "nano"],
    })
}

async fn post_build_request(server: &TestServer, body: &serde_json::Value) -> reqwest::Response {
    server
        .client
        .post(format!("{}/api/build-request", server.base_url))
        .json(body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn malformed_body_gets_empty_array() {
    let server = spawn_server().await;
    let resp = server
        .client
        .post(format!("{}/api/build-request", server.base_url))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "[]");
}

#[tokio::test]
async fn missing_fields_are_listed() {
    let server = spawn_server().await;
    let resp = post_build_request(&server, &serde_json::json!({ "target": "ar71xx" })).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    let error = body["error"].as_str().unwrap();
    assert_eq!(error, "missing parameters - need subtarget profile");
}

#[tokio::test]
async fn unknown_distro_and_target_are_rejected() {
    let server = spawn_server().await;

    let mut body = build_request_body();
    body["distro"] = "gentoo".into();
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "unknown distribution gentoo");

    let mut body = build_request_body();
    body["target"] = "ghost".into();
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "unknown target ghost/generic");

    let mut body = build_request_body();
    body["version"] = "99.99".into();
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "unknown release 99.99");
}

#[tokio::test]
async fn first_time_subtarget_queues_provisioning() {
    let server = spawn_server().await;

    // Catalogue never synced: the client is told to poll while a worker
    // provisions the imagebuilder.
    let resp = post_build_request(&server, &build_request_body()).await;
    assert_eq!(resp.status(), 201);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "imagebuilder");

    // The provisioning queue now holds the subtarget.
    let claimed = server.db.imagebuilders().claim_next().await.unwrap();
    assert_eq!(claimed, Some(key()));
}

#[tokio::test]
async fn unknown_package_is_rejected() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let mut body = build_request_body();
    body["packages"] = serde_json::json!(["luci", "ghost-pkg"]);
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        json["error"],
        "could not find package 'ghost-pkg' for requested target"
    );
}

#[tokio::test]
async fn implicit_packages_are_accepted() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let mut body = build_request_body();
    body["packages"] = serde_json::json!(["luci", "kernel", "libc", "base-files"]);
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 201);
}

#[tokio::test]
async fn unknown_profile_is_rejected() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let mut body = build_request_body();
    body["profile"] = "ghost-device".into();
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "unknown profile ghost-device");
}

#[tokio::test]
async fn identical_requests_deduplicate() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;
    // A worker holds the skill, so requests queue as plain `requested`.
    let worker_id = server.db.workers().register("w1", "", "pk").await.unwrap();
    server
        .db
        .workers()
        .register_skill(worker_id, &key(), "ready")
        .await
        .unwrap();

    let first = post_build_request(&server, &build_request_body()).await;
    assert_eq!(first.status(), 201);
    let first: serde_json::Value = first.json().await.unwrap();
    assert_eq!(first["status"], "requested");
    let request_hash = first["request_hash"].as_str().unwrap().to_string();
    assert_eq!(request_hash.len(), 12);

    // Same request with packages in a different order.
    let mut body = build_request_body();
    body["packages"] = serde_json::json!(["nano", "luci"]);
    let second = post_build_request(&server, &body).await;
    assert_eq!(second.status(), 201);
    let second: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second["request_hash"].as_str().unwrap(), request_hash);

    // Exactly one queue row exists.
    let job = server
        .db
        .requests()
        .claim_next_build_job(&[key()])
        .await
        .unwrap()
        .expect("one job");
    assert_eq!(job.request_hash, request_hash);
    assert!(server
        .db
        .requests()
        .claim_next_build_job(&[key()])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn profile_resolves_through_model_label() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let mut body = build_request_body();
    body["profile"] = "tp-link tl-wdr4300 v1".into();
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 201);
    let first: serde_json::Value = resp.json().await.unwrap();

    // The canonical profile name is what gets fingerprinted, so the model
    // label resolves to the same request.
    let resp = post_build_request(&server, &build_request_body()).await;
    let second: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(first["request_hash"], second["request_hash"]);
}

/// Simulate the worker side of a finished build for `request_hash`.
async fn simulate_build(server: &TestServer, request_hash: &str) -> String {
    let job = server
        .db
        .requests()
        .claim_next_build_job(&[key()])
        .await
        .unwrap()
        .expect("claimable job");
    assert_eq!(job.request_hash, request_hash);

    server.db.images().add_manifest("mmm0123456789ab").await.unwrap();
    server
        .db
        .images()
        .add_image(&imageforge_store::NewImage {
            image_hash: "iii0123456789ab".to_string(),
            key: key(),
            profile: "tl-wdr4300-v1".to_string(),
            manifest_hash: "mmm0123456789ab".to_string(),
            network_profile: String::new(),
            checksum: "0123456789abcdef0123456789abcdef".to_string(),
            filesize: 8,
            sysupgrade_suffix: "squashfs-sysupgrade.bin".to_string(),
            subtarget_in_name: true,
            profile_in_name: true,
            vanilla: true,
        })
        .await
        .unwrap();
    server
        .db
        .requests()
        .complete_build_job(request_hash, "iii0123456789ab")
        .await
        .unwrap();

    // Vanilla image: the canonical name elides the manifest hash.
    "lede-17.01.4-ar71xx-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin".to_string()
}

fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

async fn post_upload(
    server: &TestServer,
    request_hash: &str,
    worker_id: i64,
    archive: Vec<u8>,
    signature: String,
) -> reqwest::Response {
    let form = reqwest::multipart::Form::new()
        .text("request_hash", request_hash.to_string())
        .text("worker_id", worker_id.to_string())
        .part(
            "archive",
            reqwest::multipart::Part::bytes(archive).file_name(format!("{request_hash}.zip")),
        )
        .part(
            "signature",
            reqwest::multipart::Part::bytes(signature.into_bytes())
                .file_name(format!("{request_hash}.zip.sig")),
        );

    server
        .client
        .post(format!("{}/upload-image", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn upload_verification_and_download_round_trip() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let keypair = Keypair::from_seed([1; 32], [1; 8]);
    let worker_id = server
        .db
        .workers()
        .register("w1", "", &keypair.public_key())
        .await
        .unwrap();
    server
        .db
        .workers()
        .register_skill(worker_id, &key(), "ready")
        .await
        .unwrap();

    // Vanilla request: no extra packages.
    let mut body = build_request_body();
    body["packages"] = serde_json::json!([]);
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 201);
    let queued: serde_json::Value = resp.json().await.unwrap();
    let request_hash = queued["request_hash"].as_str().unwrap().to_string();

    let sysupgrade_name = simulate_build(&server, &request_hash).await;
    let archive = zip_archive(&[(sysupgrade_name.as_str(), b"firmware")]);

    // A signature from a different key is rejected and the request stays
    // `created`.
    let impostor = Keypair::from_seed([2; 32], [2; 8]);
    let resp = post_upload(
        &server,
        &request_hash,
        worker_id,
        archive.clone(),
        impostor.sign(&archive),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let status = server
        .db
        .requests()
        .get(&request_hash)
        .await
        .unwrap()
        .unwrap()
        .status;
    assert_eq!(status, RequestStatus::Created);

    // The genuine signature verifies, the archive is published, and the
    // request flips to ready.
    let resp = post_upload(
        &server,
        &request_hash,
        worker_id,
        archive.clone(),
        keypair.sign(&archive),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let status = server
        .db
        .requests()
        .get(&request_hash)
        .await
        .unwrap()
        .unwrap()
        .status;
    assert_eq!(status, RequestStatus::Ready);

    // Re-polling the API now returns the image info.
    let resp = post_build_request(&server, &body).await;
    assert_eq!(resp.status(), 200);
    let info: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(info["status"], "ready");
    assert_eq!(info["image_hash"], "iii0123456789ab");
    let url = info["url"].as_str().unwrap();
    assert!(url.ends_with(&sysupgrade_name));

    // And the download link serves the published artifact.
    let resp = server.client.get(url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"firmware");
}

#[tokio::test]
async fn upload_rejects_bad_metadata() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let keypair = Keypair::from_seed([3; 32], [3; 8]);
    let worker_id = server
        .db
        .workers()
        .register("w1", "", &keypair.public_key())
        .await
        .unwrap();

    let archive = zip_archive(&[("file.bin", b"data")]);
    let signature = keypair.sign(&archive);

    // Unknown request hash.
    let resp = post_upload(&server, "nosuchhash00", worker_id, archive.clone(), signature.clone()).await;
    assert_eq!(resp.status(), 400);

    // Known request but not in `created` state.
    server
        .db
        .workers()
        .register_skill(worker_id, &key(), "ready")
        .await
        .unwrap();
    let resp = post_build_request(&server, &build_request_body()).await;
    let queued: serde_json::Value = resp.json().await.unwrap();
    let request_hash = queued["request_hash"].as_str().unwrap().to_string();
    let resp = post_upload(&server, &request_hash, worker_id, archive.clone(), signature.clone()).await;
    assert_eq!(resp.status(), 400);

    // Unknown worker.
    let resp = post_upload(&server, &request_hash, 9999, archive, signature).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn catalogue_endpoints() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let distros: Vec<String> = server
        .client
        .get(format!("{}/api/distros", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(distros, vec!["lede"]);

    let releases: Vec<String> = server
        .client
        .get(format!("{}/api/releases?distro=lede", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(releases, vec!["17.01.4"]);

    let models: Vec<String> = server
        .client
        .get(format!(
            "{}/api/models?distro=lede&release=17.01.4&model_search=wdr",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models, vec!["TP-Link TL-WDR4300 v1"]);

    // Missing parameters are rejected with the empty-array body.
    let resp = server
        .client
        .get(format!("{}/api/models?distro=lede", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let packages: serde_json::Value = server
        .client
        .get(format!(
            "{}/api/packages_image?distro=lede&release=17.01.4&target=ar71xx&subtarget=generic&profile=tl-wdr4300-v1",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(packages["packages"], serde_json::json!(["base-files", "busybox"]));

    let profiles: Vec<String> = server
        .client
        .get(format!("{}/api/network_profiles", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(profiles, vec!["office"]);
}

#[tokio::test]
async fn upgrade_check_reports_latest() {
    let server = spawn_server().await;
    provision_subtarget(&server.db).await;

    let resp = server
        .client
        .post(format!("{}/api/upgrade-check", server.base_url))
        .json(&serde_json::json!({
            "distro": "lede",
            "version": "17.01.4",
            "target": "ar71xx",
            "subtarget": "generic",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["latest"], "17.01.4");
    assert_eq!(json["upgrade_available"], false);
}
