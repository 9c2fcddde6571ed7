use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();

    if target.starts_with("riscv64") {
        println!("cargo:rerun-if-changed=src/loader/stage2.ld");
        println!("cargo:rustc-link-arg=-Tsrc/loader/stage2.ld");
    }
}
