fn main() {
    println!("cargo:rerun-if-changed=proto/forsta.proto");

    prost_build::compile_protos(&["proto/forsta.proto"], &["proto/"])
        .expect("failed to compile forsta.proto");
}
