//! Reader for the remotes recorded in a location's git config.

/// A remote registered in a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

/// Extract `[remote "name"] url = …` entries from a git config file.
///
/// Only the subset of the config syntax git itself writes is understood:
/// one section header per line and `key = value` pairs. A remote without a
/// url is skipped.
pub fn parse(config: &str) -> Vec<Remote> {
    let mut remotes = Vec::new();
    let mut current: Option<String> = None;

    for line in config.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            current = line
                .strip_prefix("[remote \"")
                .and_then(|rest| rest.strip_suffix("\"]"))
                .map(str::to_string);
            continue;
        }

        if let Some(name) = &current
            && let Some((key, value)) = line.split_once('=')
            && key.trim() == "url"
        {
            remotes.push(Remote {
                name: name.clone(),
                url: value.trim().to_string(),
            });
        }
    }

    remotes
}
