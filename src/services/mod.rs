//! External collaborators of the orchestration engine.
//!
//! Each boundary is a trait so the engine can be driven by the shipped
//! adapters or by test doubles:
//!
//! - [`BatchSource`]: enumerates the members of a submitted batch
//! - [`Converter`]: converts one member, one attempt at a time
//! - [`Packager`]: bundles the completed outputs of a job

pub mod batch_source;
pub mod converter;
pub mod packager;

pub use batch_source::{BatchSource, DirectoryBatchSource, ExpansionError, SourceItem, ZipBatchSource};
pub use converter::{CommandConverter, ConversionError, ConversionRequest, Converter, OutputRef};
pub use packager::{ArchiveRef, Packager, PackagingError, ZipPackager};

/// Extension filter shared by the batch sources: case-insensitive match on
/// the extension, office lock files (`~$name`) excluded
pub(crate) fn is_accepted_member(file_name: &str, accepted_extensions: &[String]) -> bool {
    if file_name.starts_with("~$") || file_name.starts_with('.') {
        return false;
    }

    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            accepted_extensions
                .iter()
                .any(|accepted| accepted.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_filter() {
        let accepted = vec!["docx".to_string()];
        assert!(is_accepted_member("report.docx", &accepted));
        assert!(is_accepted_member("REPORT.DOCX", &accepted));
        assert!(!is_accepted_member("~$report.docx", &accepted));
        assert!(!is_accepted_member("notes.txt", &accepted));
        assert!(!is_accepted_member("docx", &accepted));
    }
}
