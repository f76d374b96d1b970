//! Library Data Models
//!
//! The shapes returned by the book backend. Characters are immutable once
//! received; a `Book` is replaced wholesale when it is fetched again.

use crate::title::format_title;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub assigned_voice_id: String,
    pub system_prompt: String,
}

impl Character {
    /// The name used on the talk button: the first word of the full name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// The body returned by the cast and upload endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CastResponse {
    #[serde(default)]
    pub book_id: Option<String>,
    #[serde(default)]
    pub book_title: Option<String>,
    #[serde(default)]
    pub characters: Vec<Character>,
}

/// The body of `GET /books`. Older backends return a bare array.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum BookListResponse {
    Bare(Vec<String>),
    Wrapped { books: Vec<String> },
}

impl BookListResponse {
    pub fn into_ids(self) -> Vec<String> {
        match self {
            BookListResponse::Bare(ids) => ids,
            BookListResponse::Wrapped { books } => books,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub book_id: String,
    pub title: String,
    pub characters: Vec<Character>,
}

impl Book {
    /// Builds a `Book` from a backend response. The backend's title wins;
    /// otherwise the title is derived from the id.
    pub fn from_response(book_id: &str, response: CastResponse) -> Self {
        let book_id = response
            .book_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| book_id.to_string());
        let title = match response.book_title {
            Some(t) if !t.trim().is_empty() => t,
            _ => format_title(&book_id),
        };
        Self {
            book_id,
            title,
            characters: response.characters,
        }
    }
}
