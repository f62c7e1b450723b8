/// Checks that a client supplied name can be used as a single path component, i.e. that it
///  can not be used to escape the directory it is joined to
pub fn is_safe_path_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains(['/', '\\', '\0'])
}
