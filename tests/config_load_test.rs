//! Config loading from a real directory.

use fibp::config::GatewayConfig;

const SAMPLE: &str = r#"
<FibpConfig>
  <System>
    <WorkingDir path="."/>
    <LogServerConnection host="127.0.0.1" port="8086" log_service="fibp-log" log_tag="fibp"/>
  </System>
  <Deployment>
    <BrokerAgent port="18280" threadnum="2" enabletest="y"/>
    <DistributedCommon localhost="127.0.0.1"/>
    <DistributedUtil>
      <ServiceDiscovery servers="127.0.0.1:8500"/>
    </DistributedUtil>
  </Deployment>
</FibpConfig>
"#;

#[test]
fn loads_config_xml_from_the_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.xml"), SAMPLE).unwrap();
    let cfg = GatewayConfig::load(dir.path()).expect("config should load");
    assert_eq!(cfg.driver_port(), 18280);
    assert_eq!(cfg.rpc_port(), 18282);
    assert_eq!(cfg.log_service, "fibp-log");
}

#[test]
fn missing_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let gone = dir.path().join("does-not-exist");
    assert!(GatewayConfig::load(&gone).is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(GatewayConfig::load(dir.path()).is_err());
}
