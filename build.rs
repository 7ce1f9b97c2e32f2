use std::env;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(hvprobe_asm)");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // The routines use ELF directives; other object formats take the portable path.
    let dir = match (arch.as_str(), os.as_str()) {
        ("x86_64", "linux") | ("x86_64", "android") => "asm/x86_64",
        ("aarch64", "linux") | ("aarch64", "android") => "asm/aarch64",
        _ => {
            println!("cargo:warning=hvprobe: no counter/flush routines for {}-{}, using portable fallbacks", arch, os);
            return;
        }
    };

    let timestamp = format!("{}/timestamp.s", dir);
    let cache = format!("{}/cache.s", dir);

    cc::Build::new()
        .file(&timestamp)
        .file(&cache)
        .compile("hvprobe_asm");

    println!("cargo:rustc-cfg=hvprobe_asm");
    println!("cargo:rerun-if-changed={}", timestamp);
    println!("cargo:rerun-if-changed={}", cache);
    println!("cargo:rerun-if-changed=build.rs");
}
