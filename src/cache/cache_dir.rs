use std::path::PathBuf;

/// Default cache root following platform conventions
///
/// - Linux/Unix: $XDG_CACHE_HOME/geoflow or ~/.cache/geoflow
/// - macOS: ~/Library/Caches/geoflow
/// - Windows: %LOCALAPPDATA%/geoflow
pub fn default_cache_dir() -> PathBuf {
    match dirs::cache_dir() {
        Some(cache_dir) => cache_dir.join("geoflow"),
        None => PathBuf::from(".geoflow/cache"),
    }
}
