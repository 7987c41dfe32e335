//! Human-readable function names.

/// Demangles a Rust symbol name, falling back to the name as given.
///
/// Mach-O prefixes C-level names with an extra underscore; it is stripped before
/// trying again.
pub fn display_name(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    if let Some(stripped) = name.strip_prefix('_') {
        if let Ok(demangled) = rustc_demangle::try_demangle(stripped) {
            return format!("{:#}", demangled);
        }
    }
    name.to_owned()
}
