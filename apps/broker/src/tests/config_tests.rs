use super::*;

#[test]
fn defaults_to_loopback() {
    assert_eq!(settings_from(None, |_| None).bind_addr, "127.0.0.1:8787");
}

#[test]
fn file_then_env() {
    let raw = r#"bind_addr = "0.0.0.0:9000""#;
    assert_eq!(settings_from(Some(raw), |_| None).bind_addr, "0.0.0.0:9000");

    let settings = settings_from(Some(raw), |key| {
        (key == "APP__BIND_ADDR").then(|| "127.0.0.1:7000".to_string())
    });
    assert_eq!(settings.bind_addr, "127.0.0.1:7000");
}

#[test]
fn unparsable_file_keeps_defaults() {
    assert_eq!(
        settings_from(Some("bind_addr = "), |_| None),
        BrokerSettings::default()
    );
}
