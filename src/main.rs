// ABOUTME: Entry point for the Agent Desktop Tauri application.
// ABOUTME: Starts the shell, which installs and supervises the embedded backend.

// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

fn main() {
    agent_desktop_lib::run()
}
