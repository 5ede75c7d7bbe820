fn main() {
    // The orchestrator library builds without Tauri; only the shell needs codegen.
    #[cfg(feature = "desktop")]
    tauri_build::build()
}
