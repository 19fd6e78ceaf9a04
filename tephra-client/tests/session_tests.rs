//! End-to-end session tests against a synthetic CDN.
//!
//! A complete miniature build is assembled in memory: one archive with
//! its index, a file index of standalone blobs, an encoding table, a
//! root manifest, and an install manifest, all served from a mock
//! mirror. Opening the session exercises the whole bring-up chain,
//! including the local group-index build.

use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tephra_cdn::CancelSignal;
use tephra_client::{BuildSession, Error, SessionConfig};
use tephra_formats::group::test_support::write_index;
use tephra_formats::jenkins3::hash_path;
use tephra_formats::root::LocaleFlags;
use tephra_formats::{CKey, EKey};

const GAME_PAYLOAD: &[u8] = b"Hello, content pipeline!";
const GAME_FDID: u32 = 5;
const GAME_NAME: &str = "interface/icons/temp.blp";

/// Wrap a payload in an unframed raw-mode container.
fn blte_wrap(payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(b"BLTE");
    blob.extend_from_slice(&0u32.to_be_bytes());
    blob.push(b'N');
    blob.extend_from_slice(payload);
    blob
}

fn md5_of(bytes: &[u8]) -> [u8; 16] {
    md5::compute(bytes).0
}

/// Build a one-page encoding blob for the given (sorted) entries.
fn encoding_blob(entries: &[(CKey, EKey, u64)], especs: &[(EKey, u64)]) -> Vec<u8> {
    let page_size = 1024usize;
    let espec_strings = b"z\0".to_vec();

    let mut data = Vec::new();
    data.extend_from_slice(b"EN");
    data.push(1);
    data.push(16);
    data.push(16);
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    data.push(0);
    data.extend_from_slice(&(espec_strings.len() as u32).to_be_bytes());
    data.extend_from_slice(&espec_strings);

    let mut ckey_page = Vec::new();
    for (ckey, ekey, size) in entries {
        ckey_page.push(1u8);
        ckey_page.extend_from_slice(&size.to_be_bytes()[3..]);
        ckey_page.extend_from_slice(ckey.as_bytes());
        ckey_page.extend_from_slice(ekey.as_bytes());
    }
    ckey_page.resize(page_size, 0);

    let mut espec_page = Vec::new();
    for (ekey, size) in especs {
        espec_page.extend_from_slice(ekey.as_bytes());
        espec_page.extend_from_slice(&0u32.to_be_bytes());
        espec_page.extend_from_slice(&size.to_be_bytes()[3..]);
    }
    espec_page.resize(page_size, 0);

    data.extend_from_slice(entries[0].0.as_bytes());
    data.extend_from_slice(&md5_of(&ckey_page));
    data.extend_from_slice(&ckey_page);
    data.extend_from_slice(especs[0].0.as_bytes());
    data.extend_from_slice(&md5_of(&espec_page));
    data.extend_from_slice(&espec_page);
    data
}

/// Build a v2 root blob with one page of named records.
fn root_blob(records: &[(u32, [u8; 16], u64)]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"MFST");
    data.extend_from_slice(&24u32.to_le_bytes());
    data.extend_from_slice(&2u32.to_le_bytes());
    data.extend_from_slice(&(records.len() as u32).to_le_bytes());
    data.extend_from_slice(&(records.len() as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());

    data.extend_from_slice(&(records.len() as u32).to_le_bytes());
    data.extend_from_slice(&0x2u32.to_le_bytes()); // enUS
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.push(0);

    let mut previous = 0u32;
    for (i, (fdid, _, _)) in records.iter().enumerate() {
        let delta = if i == 0 { *fdid } else { fdid - previous - 1 };
        data.extend_from_slice(&delta.to_le_bytes());
        previous = *fdid;
    }
    for (_, ckey, _) in records {
        data.extend_from_slice(ckey);
    }
    for (_, _, name_hash) in records {
        data.extend_from_slice(&name_hash.to_le_bytes());
    }
    data
}

async fn serve(server: &MockServer, remote_path: String, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(remote_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}

fn fan(hex: &str) -> String {
    format!("{}/{}/{hex}", &hex[..2], &hex[2..4])
}

struct Universe {
    server: MockServer,
    build_hash: String,
    cdn_hash: String,
    game_ckey: CKey,
    game_ekey: EKey,
}

/// Assemble and serve a complete miniature build.
async fn build_universe() -> Universe {
    let server = MockServer::start().await;

    // Leaf blobs.
    let game_ckey = CKey::new(md5_of(GAME_PAYLOAD));
    let game_blte = blte_wrap(GAME_PAYLOAD);
    let game_ekey = EKey::new(md5_of(&game_blte));

    let root_bytes = root_blob(&[(GAME_FDID, *game_ckey.as_bytes(), hash_path(GAME_NAME))]);
    let root_ckey = CKey::new(md5_of(&root_bytes));
    let root_blte = blte_wrap(&root_bytes);
    let root_ekey = EKey::new(md5_of(&root_blte));

    let install_text = format!("Wow.exe\t{game_ckey}\t{}\n", GAME_PAYLOAD.len());
    let install_ckey = CKey::new(md5_of(install_text.as_bytes()));
    let install_blte = blte_wrap(install_text.as_bytes());
    let install_ekey = EKey::new(md5_of(&install_blte));

    // Root and the game file live in one archive; the archive's index
    // is what the group index gets built from.
    let archive_bytes: Vec<u8> = [root_blte.clone(), game_blte.clone()].concat();
    let mut archive_entries = vec![
        (
            root_ekey.as_bytes().to_vec(),
            root_blte.len() as u64,
            0u64,
        ),
        (
            game_ekey.as_bytes().to_vec(),
            game_blte.len() as u64,
            root_blte.len() as u64,
        ),
    ];
    archive_entries.sort();

    let scratch = TempDir::new().unwrap();
    let archive_index_path = scratch.path().join("archive.index");
    let archive_hash = write_index(&archive_index_path, &archive_entries, 4, 16, 4, 4);

    // Encoding and install are standalone blobs named by the file index.
    let encoding_entries_sorted = {
        let mut entries = vec![
            (root_ckey, root_ekey, root_bytes.len() as u64),
            (install_ckey, install_ekey, install_text.len() as u64),
            (game_ckey, game_ekey, GAME_PAYLOAD.len() as u64),
        ];
        entries.sort_by_key(|(ckey, _, _)| *ckey);
        entries
    };
    let encoding_bytes = encoding_blob(
        &encoding_entries_sorted,
        &[(root_ekey, root_blte.len() as u64)],
    );
    let encoding_blte = blte_wrap(&encoding_bytes);
    let encoding_ckey = CKey::new(md5_of(&encoding_bytes));
    let encoding_ekey = EKey::new(md5_of(&encoding_blte));

    let mut file_entries = vec![
        (
            encoding_ekey.as_bytes().to_vec(),
            encoding_blte.len() as u64,
            0u64,
        ),
        (
            install_ekey.as_bytes().to_vec(),
            install_blte.len() as u64,
            0u64,
        ),
    ];
    file_entries.sort();
    let file_index_path = scratch.path().join("file.index");
    let file_index_hash = write_index(&file_index_path, &file_entries, 4, 16, 4, 0);

    // Configuration blobs.
    let build_text = format!(
        "# synthetic build\n\
         root = {root_ckey}\n\
         install = {install_ckey}\n\
         encoding = {encoding_ckey} {encoding_ekey}\n\
         encoding-size = {} {}\n",
        encoding_bytes.len(),
        encoding_blte.len(),
    );
    let cdn_text = format!(
        "archives = {archive_hash}\n\
         file-index = {file_index_hash}\n"
    );
    let build_hash = hex::encode(md5_of(build_text.as_bytes()));
    let cdn_hash = hex::encode(md5_of(cdn_text.as_bytes()));

    // Mount everything.
    serve(
        &server,
        format!("/tpr/wow/config/{}", fan(&build_hash)),
        build_text.into_bytes(),
    )
    .await;
    serve(
        &server,
        format!("/tpr/wow/config/{}", fan(&cdn_hash)),
        cdn_text.into_bytes(),
    )
    .await;
    serve(
        &server,
        format!("/tpr/wow/data/{}.index", fan(&archive_hash)),
        std::fs::read(&archive_index_path).unwrap(),
    )
    .await;
    serve(
        &server,
        format!("/tpr/wow/data/{}.index", fan(&file_index_hash)),
        std::fs::read(&file_index_path).unwrap(),
    )
    .await;
    serve(
        &server,
        format!("/tpr/wow/data/{}", fan(&encoding_ekey.to_string())),
        encoding_blte.clone(),
    )
    .await;
    serve(
        &server,
        format!("/tpr/wow/data/{}", fan(&install_ekey.to_string())),
        install_blte.clone(),
    )
    .await;

    // Ranged requests against the archive.
    for (ekey_blob, offset) in [
        (root_blte.clone(), 0u64),
        (game_blte.clone(), root_blte.len() as u64),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/tpr/wow/data/{}", fan(&archive_hash))))
            .and(header(
                "range",
                format!("bytes={}-{}", offset, offset + ekey_blob.len() as u64 - 1).as_str(),
            ))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(
                archive_bytes[offset as usize..offset as usize + ekey_blob.len()].to_vec(),
            ))
            .mount(&server)
            .await;
    }

    // HEAD probes get a method-not-allowed, which counts as no answer.
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    Universe {
        server,
        build_hash,
        cdn_hash,
        game_ckey,
        game_ekey,
    }
}

fn session_config(universe: &Universe, cache_dir: &TempDir) -> SessionConfig {
    SessionConfig {
        region: "us".to_string(),
        locale: LocaleFlags::named("enUS").unwrap(),
        cache_dir: cache_dir.path().to_path_buf(),
        build_config: Some(universe.build_hash.clone()),
        cdn_config: Some(universe.cdn_hash.clone()),
        mirror_hosts: Some(vec![universe.server.uri()]),
        cdn_stem: Some("tpr/wow".to_string()),
        ..SessionConfig::new("wow")
    }
}

#[tokio::test]
async fn opens_build_and_extracts_by_every_identifier() {
    let universe = build_universe().await;
    let cache_dir = TempDir::new().unwrap();

    let session = BuildSession::open(session_config(&universe, &cache_dir))
        .await
        .unwrap();

    // By file data ID, through root → encoding → group index.
    let bytes = session.extract_by_fdid(GAME_FDID).await.unwrap();
    assert_eq!(bytes, GAME_PAYLOAD);

    // By path hash.
    let bytes = session.extract_by_name(GAME_NAME).await.unwrap();
    assert_eq!(bytes, GAME_PAYLOAD);

    // By install manifest name.
    let bytes = session.extract_by_name("Wow.exe").await.unwrap();
    assert_eq!(bytes, GAME_PAYLOAD);

    // By content key directly.
    let bytes = session.extract_by_ckey(&universe.game_ckey).await.unwrap();
    assert_eq!(bytes, GAME_PAYLOAD);

    // Raw fetch by encoding key returns the still-encoded blob.
    let raw = session
        .fetch_by_ekey(&universe.game_ekey, 0)
        .await
        .unwrap();
    assert_eq!(raw, blte_wrap(GAME_PAYLOAD));
}

#[tokio::test]
async fn group_index_is_built_into_the_cache() {
    let universe = build_universe().await;
    let cache_dir = TempDir::new().unwrap();

    BuildSession::open(session_config(&universe, &cache_dir))
        .await
        .unwrap();

    // The locally built group index lands next to the fetched ones.
    let product_root = cache_dir.path().join("wow");
    let indices: Vec<_> = std::fs::read_dir(&product_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext == "index")
        })
        .collect();
    // Archive index, file index, and the built group index.
    assert_eq!(indices.len(), 3);
}

#[tokio::test]
async fn missing_identifiers_are_clean_errors() {
    let universe = build_universe().await;
    let cache_dir = TempDir::new().unwrap();

    let session = BuildSession::open(session_config(&universe, &cache_dir))
        .await
        .unwrap();

    assert!(matches!(
        session.extract_by_fdid(999).await,
        Err(Error::FileNotFound { .. })
    ));
    assert!(matches!(
        session.extract_by_name("no/such/file.blp").await,
        Err(Error::FileNotFound { .. })
    ));
}

#[tokio::test]
async fn cancelled_signal_aborts_session_open() {
    let universe = build_universe().await;
    let cache_dir = TempDir::new().unwrap();

    let (handle, cancel) = CancelSignal::manual();
    handle.cancel();

    let config = SessionConfig {
        cancel,
        ..session_config(&universe, &cache_dir)
    };
    let err = BuildSession::open(config).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cdn(tephra_cdn::Error::Cancelled { .. })
    ));
}

#[tokio::test]
async fn second_open_is_served_from_cache() {
    let universe = build_universe().await;
    let cache_dir = TempDir::new().unwrap();

    let session = BuildSession::open(session_config(&universe, &cache_dir))
        .await
        .unwrap();
    assert_eq!(
        session.extract_by_fdid(GAME_FDID).await.unwrap(),
        GAME_PAYLOAD
    );
    let requests_after_first = universe.server.received_requests().await.unwrap().len();

    // Everything needed for bring-up and this extraction is now cached.
    let session = BuildSession::open(session_config(&universe, &cache_dir))
        .await
        .unwrap();
    assert_eq!(
        session.extract_by_fdid(GAME_FDID).await.unwrap(),
        GAME_PAYLOAD
    );
    assert_eq!(
        universe.server.received_requests().await.unwrap().len(),
        requests_after_first
    );
}
