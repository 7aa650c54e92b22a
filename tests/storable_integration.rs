// Export and import of chains through files in every interchange format

use keychain::crypto::KdfParams;
use keychain::storable::{self, StorableFormat};
use keychain::{Keychain, KeychainService};
use std::collections::HashMap;
use std::path::Path;

fn service() -> KeychainService {
    KeychainService::new().with_kdf(KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    })
}

fn keys(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(chain, key)| (chain.to_string(), key.to_string()))
        .collect()
}

/// A store with one chain holding awkward values that every codec must
/// carry through unchanged.
fn source_store(service: &KeychainService, path: &Path) -> Keychain {
    let mut doc = service.init(path, false).unwrap();
    let chain_id = service
        .create_chain(&mut doc, "Work", "Office, \"main\" site", "work-key")
        .unwrap();
    let secret = service
        .unlock_chain(doc.find_chain(chain_id).unwrap(), "work-key")
        .unwrap();
    service
        .add_link(&mut doc, chain_id, &secret, "Email", "first line", "p,a\"ss")
        .unwrap();
    service
        .add_link(&mut doc, chain_id, &secret, "Vpn", "", "line1\nline2\\end")
        .unwrap();
    service.save(&doc, path).unwrap();
    doc
}

fn reveal(service: &KeychainService, doc: &Keychain, chain: &str, key: &str, link: &str) -> String {
    let chain = doc.find_chain_by_name(chain).unwrap();
    let secret = service.unlock_chain(chain, key).unwrap();
    let link = doc.find_link_by_name(chain.id, link).unwrap();
    service.reveal_password(link, &secret).unwrap().to_string()
}

#[test]
fn test_plain_export_import_every_format() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let source = source_store(&service, &dir.path().join("source.json"));

    for (ext, format) in [
        ("json", StorableFormat::Json),
        ("csv", StorableFormat::Csv),
        ("txt", StorableFormat::Txt),
    ] {
        let mut provider = keys(&[("Work", "work-key")]);
        let exported = storable::export(&service, &source, &[], false, &mut provider).unwrap();
        assert!(!exported.private);

        let file = dir.path().join(format!("plain.{ext}"));
        storable::write_file(&file, &exported, None).unwrap();
        assert_eq!(StorableFormat::from_path(&file).unwrap(), format);

        let read = storable::read_file(&file, None).unwrap();
        assert_eq!(read, exported, "{ext} did not survive the file");

        let mut target = service
            .init(&dir.path().join(format!("target-{ext}.json")), false)
            .unwrap();
        let mut provider = keys(&[("Work", "new-key")]);
        let report = storable::import(&service, &mut target, &read, &mut provider).unwrap();
        assert_eq!(report.chains_created, 1);
        assert_eq!(report.links_created, 2);

        assert_eq!(reveal(&service, &target, "Work", "new-key", "Email"), "p,a\"ss");
        assert_eq!(
            reveal(&service, &target, "Work", "new-key", "Vpn"),
            "line1\nline2\\end"
        );
        assert_eq!(
            target.find_chain_by_name("Work").unwrap().description,
            "Office, \"main\" site"
        );
    }
}

#[test]
fn test_private_export_keeps_original_key() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let source = source_store(&service, &dir.path().join("source.json"));

    for ext in ["json", "csv", "txt"] {
        // Private exports never ask for a key
        let mut provider = keys(&[]);
        let exported = storable::export(&service, &source, &[], true, &mut provider).unwrap();
        let file = dir.path().join(format!("private.{ext}"));
        storable::write_file(&file, &exported, None).unwrap();

        let read = storable::read_file(&file, None).unwrap();
        assert!(read.private);

        let mut target = service
            .init(&dir.path().join(format!("copy-{ext}.json")), false)
            .unwrap();
        let report = storable::import(&service, &mut target, &read, &mut provider).unwrap();
        assert_eq!(report.chains_created, 1);

        assert_eq!(reveal(&service, &target, "Work", "work-key", "Email"), "p,a\"ss");
    }
}

#[test]
fn test_import_into_existing_chain_merges_links() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let source = source_store(&service, &dir.path().join("source.json"));

    let mut provider = keys(&[("Work", "work-key")]);
    let exported = storable::export(&service, &source, &[], false, &mut provider).unwrap();

    let target_path = dir.path().join("target.json");
    let mut target = service.init(&target_path, false).unwrap();
    let chain_id = service
        .create_chain(&mut target, "Work", "", "local-key")
        .unwrap();
    let secret = service
        .unlock_chain(target.find_chain(chain_id).unwrap(), "local-key")
        .unwrap();
    service
        .add_link(&mut target, chain_id, &secret, "Email", "", "stale")
        .unwrap();
    service
        .add_link(&mut target, chain_id, &secret, "Bank", "", "keep-me")
        .unwrap();

    let mut provider = keys(&[("Work", "local-key")]);
    let report = storable::import(&service, &mut target, &exported, &mut provider).unwrap();
    assert_eq!(report.chains_created, 0);
    assert_eq!(report.links_created, 1);
    assert_eq!(report.links_updated, 1);

    assert_eq!(reveal(&service, &target, "Work", "local-key", "Email"), "p,a\"ss");
    assert_eq!(reveal(&service, &target, "Work", "local-key", "Bank"), "keep-me");

    // Importing the same file again changes nothing
    let report = storable::import(&service, &mut target, &exported, &mut provider).unwrap();
    assert_eq!(report.links_created, 0);
    assert_eq!(report.links_updated, 0);
    assert_eq!(report.links_unchanged, 2);
}

#[test]
fn test_unknown_extension_needs_explicit_format() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let source = source_store(&service, &dir.path().join("source.json"));
    let exported = storable::export(&service, &source, &[], true, &mut keys(&[])).unwrap();

    let file = dir.path().join("backup.dat");
    assert!(storable::write_file(&file, &exported, None).is_err());
    storable::write_file(&file, &exported, Some(StorableFormat::Txt)).unwrap();
    let read = storable::read_file(&file, Some(StorableFormat::Txt)).unwrap();
    assert_eq!(read, exported);
}
