fn main() {
    println!("cargo:rerun-if-changed=proto/entry.proto");
    prost_build::compile_protos(&["proto/entry.proto"], &["proto/"]).expect("compile entry.proto");
}
