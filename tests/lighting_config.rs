use std::fs;

use umbra::LightingParams;

#[test]
fn loads_a_full_config_from_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("lighting.json");
    fs::write(
        &path,
        r#"{
            "shadow_atlas_resolution": 4096,
            "cookie_atlas_resolution": 256,
            "atlas_split": [2, 1, 1, 1, 3],
            "shadows_enabled": true,
            "cookies_enabled": false,
            "clustered": true
        }"#,
    )
    .expect("write config");

    let params = LightingParams::load(&path).expect("load config");
    assert_eq!(params.shadow_atlas_resolution, 4096);
    assert_eq!(params.cookie_atlas_resolution, 256);
    assert_eq!(params.atlas_split.as_deref(), Some(&[2, 1, 1, 1, 3][..]));
    assert!(!params.cookies_enabled);
    assert!(params.clustered);
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("lighting.json");
    fs::write(&path, r#"{ "clustered": true }"#).expect("write config");

    let params = LightingParams::load(&path).expect("load config");
    assert_eq!(params.shadow_atlas_resolution, 2048);
    assert!(params.atlas_split.is_none());
    assert!(params.shadows_enabled);
    assert!(params.clustered);
}

#[test]
fn unreadable_config_reports_the_path() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("absent.json");
    let err = LightingParams::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("absent.json"));
}

#[test]
fn malformed_config_is_a_parse_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("lighting.json");
    fs::write(&path, "{ not json").expect("write config");
    let err = LightingParams::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("parse"));
}
