//! The list of known books, in the order they are shown.

use crate::title::format_title;

#[derive(Debug, Clone, PartialEq)]
pub struct SidebarEntry {
    pub book_id: String,
    pub title: String,
}

/// Known books, deduplicated by display title.
///
/// Listing preserves first-seen order. Uploads jump to the front so a freshly
/// uploaded book is visible straight away.
#[derive(Debug, Default, Clone)]
pub struct SidebarModel {
    entries: Vec<SidebarEntry>,
}

impl SidebarModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every id from a library listing. Returns how many were new.
    pub fn extend_from_listing<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.insert(id.as_ref()))
            .count()
    }

    /// Appends a book unless one with the same title is already listed.
    pub fn insert(&mut self, book_id: &str) -> bool {
        let title = format_title(book_id);
        if self.position_of_title(&title).is_some() {
            return false;
        }
        self.entries.push(SidebarEntry {
            book_id: book_id.to_string(),
            title,
        });
        true
    }

    /// Records an upload. A book with the same title is replaced and the
    /// entry moves to the top.
    pub fn promote_upload(&mut self, book_id: &str, title: &str) {
        if let Some(idx) = self.position_of_title(title) {
            self.entries.remove(idx);
        }
        self.entries.insert(
            0,
            SidebarEntry {
                book_id: book_id.to_string(),
                title: title.to_string(),
            },
        );
    }

    pub fn entries(&self) -> &[SidebarEntry] {
        &self.entries
    }

    /// Looks up an entry by its 1-based display position or by book id.
    pub fn resolve(&self, key: &str) -> Option<&SidebarEntry> {
        if let Ok(n) = key.parse::<usize>() {
            if n >= 1 {
                if let Some(entry) = self.entries.get(n - 1) {
                    return Some(entry);
                }
            }
        }
        self.entries.iter().find(|e| e.book_id == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position_of_title(&self, title: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.title == title)
    }
}
