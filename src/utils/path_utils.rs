use std::path::{Component, Path, PathBuf};

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// The current user's home directory, if `~` expands to something absolute.
pub fn home_dir() -> Option<PathBuf> {
    let home = expand_tilde_path_buf("~");
    home.is_absolute().then_some(home)
}

/// Resolves `target` against `cwd` without touching the filesystem.
///
/// Tilde is expanded, relative targets are joined onto `cwd`, and `.` / `..`
/// components are folded lexically so the result stays the path the user
/// typed rather than its symlink-resolved form. `..` at the root stays at
/// the root.
pub fn resolve_against(cwd: &Path, target: &str) -> PathBuf {
    let expanded_path = expand_tilde_path_buf(target);

    let absolute_path = if expanded_path.is_absolute() {
        expanded_path
    } else {
        cwd.join(expanded_path)
    };

    let mut components: Vec<Component> = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}
