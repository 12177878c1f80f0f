fn read_required<F>(lookup: &F, name: &str) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{name} is not set"))
}

fn read_string<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_u64_env<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Hours are `0..=23`, so zero is a valid value here.
fn read_hour_env<F>(lookup: &F, name: &str, default: u8) -> anyhow::Result<u8>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u8>()
            .with_context(|| format!("{name} must be an hour between 0 and 23")),
        _ => Ok(default),
    }
}

fn read_delete_policy<F>(lookup: &F) -> anyhow::Result<DeletePolicy>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("MIRROR_DELETE_POLICY").filter(|value| !value.trim().is_empty()) {
        return value
            .parse::<DeletePolicy>()
            .map_err(|err| anyhow::anyhow!("MIRROR_DELETE_POLICY: {err}"));
    }
    if read_bool_env(lookup, "MIRROR_DELETE_MISSING", false) {
        return Ok(DeletePolicy::Missing);
    }
    Ok(DeletePolicy::Keep)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn expand_path(value: &str, home: Option<&Path>) -> PathBuf {
    let value = value.trim();
    match home {
        Some(home) => expand_with_home(value, home),
        None => PathBuf::from(value),
    }
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("yadisk-mirror")
}
