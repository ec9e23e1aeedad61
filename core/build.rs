fn main() {
    prost_build::Config::new()
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .btree_map(["."])
        .compile_protos(&["proto/s2p_interface.proto"], &["proto/"])
        .expect("failed to compile management protobuf schema");
}
