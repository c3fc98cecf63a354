use std::env;
use std::fs;
use std::path::Path;

pub(crate) fn command_exists(cmd: &str) -> bool {
    let path = Path::new(cmd);
    if path.components().count() > 1 {
        return is_executable(path);
    }

    let path_var = match env::var_os("PATH") {
        Some(value) => value,
        None => return false,
    };

    #[cfg(windows)]
    let candidates = windows_command_candidates(cmd);
    #[cfg(not(windows))]
    let candidates = vec![cmd.to_string()];

    for dir in env::split_paths(&path_var) {
        for candidate in &candidates {
            if is_executable(&dir.join(candidate)) {
                return true;
            }
        }
    }
    false
}

fn is_executable(path: &Path) -> bool {
    let metadata = match fs::metadata(path) {
        Ok(value) => value,
        Err(_) => return false,
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(windows)]
fn windows_command_candidates(cmd: &str) -> Vec<String> {
    let path = Path::new(cmd);
    if path.extension().is_some() {
        return vec![cmd.to_string()];
    }
    let pathext = env::var_os("PATHEXT").unwrap_or_else(|| ".EXE;.CMD;.BAT;.COM".into());
    pathext
        .to_string_lossy()
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!("{}{}", cmd, ext.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_command_is_not_found() {
        assert!(!command_exists("definitely-not-a-real-binary-7f3a"));
        assert!(!command_exists("/nonexistent/dir/tool"));
    }
}
