/// Placeholder shown for books without a usable identifier.
pub const UNKNOWN_BOOK: &str = "Unknown Book";

/// Turns a raw book identifier (usually an uploaded filename) into a display title.
///
/// `the_great_gatsby_1735158899` becomes `The Great Gatsby` and `moby-dick.txt`
/// becomes `Moby Dick`.
pub fn format_title(book_id: &str) -> String {
    let mut stem = book_id.trim();

    if let Some(idx) = stem.rfind('.') {
        if idx > 0 {
            stem = &stem[..idx];
        }
    }

    // Uploads carry a `_<unix timestamp>` suffix.
    if let Some(idx) = stem.rfind('_') {
        let suffix = &stem[idx + 1..];
        if idx > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            stem = &stem[..idx];
        }
    }

    let title = stem
        .split(['_', '-'])
        .filter(|token| !token.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        UNKNOWN_BOOK.to_string()
    } else {
        title
    }
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
