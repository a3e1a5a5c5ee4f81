use std::fs;
use std::path::{Path, PathBuf};

/// Tokens that mean a library module is doing I/O or CLI work.
const LIBRARY_FORBIDDEN: &[&str] = &[
    "csv::",
    "clap::",
    "env_logger",
    "std::io::stdin",
    "std::io::stdout",
    "println!(",
    "std::process::exit",
];

/// Binary entry points allowed to use them.
const BINARY_SOURCES: &[&str] = &["main.rs"];

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let mut sources = Vec::new();
    collect_rust_sources(Path::new("src"), &mut sources);
    let violations: Vec<String> = sources
        .iter()
        .filter(|path| {
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            !BINARY_SOURCES.contains(&name)
        })
        .flat_map(|path| library_violations(path))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nerror: I/O leaked into xpspec library modules:");
        for v in &violations {
            eprintln!("  - {v}");
        }
        panic!("{} I/O boundary violation(s) in xpspec library modules", violations.len());
    }
}

fn collect_rust_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            collect_rust_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

fn library_violations(path: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .enumerate()
        .flat_map(|(idx, line)| {
            LIBRARY_FORBIDDEN
                .iter()
                .filter(move |token| line.contains(*token))
                .map(move |token| format!("{}:{} uses '{token}'", path.display(), idx + 1))
        })
        .collect()
}
