fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use shipyard_content_hash::{ContentHash, blob_hash};
    use shipyard_protocol::{
        AssetListResponse, DeployEvent, DeployStatus, SubmitDeployRequest, SubmitDeployResponse,
        UploadAssetResponse,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture into `T`, re-serializes it and compares the
    /// JSON values. Returns the parsed value for further checks.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Deploy events ---

    #[test]
    fn fixture_deploy_event_in_progress() {
        let ev: DeployEvent = roundtrip_test("deploy_event_in_progress.json");
        assert_eq!(ev.status, DeployStatus::InProgress);
        assert!(!ev.is_terminal());
        assert!(ev.error.is_none());
    }

    #[test]
    fn fixture_deploy_event_failed() {
        let ev: DeployEvent = roundtrip_test("deploy_event_failed.json");
        assert_eq!(ev.status, DeployStatus::Failed);
        assert!(ev.is_terminal());
        assert_eq!(ev.error.as_deref(), Some("exit status 137"));
    }

    // --- Deploy submission ---

    #[test]
    fn fixture_submit_deploy_request() {
        let req: SubmitDeployRequest = roundtrip_test("submit_deploy_request.json");
        assert_eq!(req.metadata.port, Some(8080));
        assert_eq!(req.metadata.secrets.as_ref().map(Vec::len), Some(2));
        let checksum: ContentHash = req.checksum.parse().unwrap();
        assert_eq!(checksum, ContentHash::EMPTY_TREE);
    }

    #[test]
    fn fixture_submit_deploy_response() {
        let resp: SubmitDeployResponse = roundtrip_test("submit_deploy_response.json");
        assert_eq!(resp.task_id, "task-7f3a");
    }

    // --- Asset store ---

    #[test]
    fn fixture_asset_list_response() {
        let listing: AssetListResponse = roundtrip_test("asset_list_response.json");
        assert!(listing.contains("d8329fc1cc938780ffdd9f94e0d364e0ea74f579"));
        assert!(!listing.contains(&ContentHash::EMPTY_TREE.to_hex()));
    }

    #[test]
    fn fixture_upload_asset_response() {
        let resp: UploadAssetResponse = roundtrip_test("upload_asset_response.json");
        let confirmed: ContentHash = resp.checksum.parse().unwrap();
        assert_eq!(confirmed.to_hex(), resp.checksum);
    }

    // --- Git object ids ---

    #[test]
    fn fixture_git_objects() {
        let fixture = load_fixture("git_objects.json");
        for blob in fixture["blobs"].as_array().unwrap() {
            let content = blob["content"].as_str().unwrap();
            let expected: ContentHash = serde_json::from_value(blob["id"].clone()).unwrap();
            assert_eq!(blob_hash(content.as_bytes()), expected, "blob {content:?}");
        }
        let empty: ContentHash = serde_json::from_value(fixture["emptyTree"].clone()).unwrap();
        assert_eq!(empty, ContentHash::EMPTY_TREE);
    }
}
