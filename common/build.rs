// Copyright 2026 Oxide Computer Company
use vergen::EmitBuilder;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    EmitBuilder::builder()
        .all_build()
        .all_cargo()
        .all_rustc()
        .emit()
        .unwrap();
}
