fn main() {
    // Exposes GIT_COMMIT_HASH and package metadata to /health.
    built::write_built_file().expect("Failed to write build metadata");
}
