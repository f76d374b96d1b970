//! Terminal commands and their effect on the library, the stage and the
//! conversation controller.

use crate::console;
use fourthwall_core::{
    card::{CardId, CardRegistry},
    controller::ConversationHandle,
    error::LibraryError,
    library_client::LibraryClient,
    models::Book,
    sidebar::SidebarModel,
};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tracing::{error, info, instrument, warn};

pub const WELCOME_TITLE: &str = "Fourth Wall";
pub const CASTING_TITLE: &str = "Casting characters...";
pub const BACKEND_ERROR_TITLE: &str = "Error loading characters. Is the backend running?";

pub const HELP: &str = "\
Commands:
  books            list the library
  open <n|id>      load a book's cast
  upload <path>    upload a book (.txt, under 5 MiB)
  talk <n>         start or stop talking to card n
  close <n>        end the conversation on card n
  cards            show the stage
  help             show this help
  quit             exit";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command '{0}'. Type `help` for a list.")]
    Unknown(String),
    #[error("`{0}` needs an argument.")]
    MissingArgument(&'static str),
    #[error("'{0}' is not a card number.")]
    InvalidCard(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Books,
    Open(String),
    Upload(PathBuf),
    Talk(CardId),
    Close(CardId),
    Cards,
    Help,
    Quit,
}

fn parse_card(arg: &str) -> Result<CardId, CommandError> {
    match arg.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(CardId(n - 1)),
        _ => Err(CommandError::InvalidCard(arg.to_string())),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };
        let required = |name: &'static str| {
            if arg.is_empty() {
                Err(CommandError::MissingArgument(name))
            } else {
                Ok(arg)
            }
        };
        match verb.to_lowercase().as_str() {
            "books" | "ls" => Ok(Command::Books),
            "open" => Ok(Command::Open(required("open")?.to_string())),
            "upload" => Ok(Command::Upload(PathBuf::from(required("upload")?))),
            "talk" => Ok(Command::Talk(parse_card(required("talk")?)?)),
            "close" => Ok(Command::Close(parse_card(required("close")?)?)),
            "cards" => Ok(Command::Cards),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Everything the command loop acts on.
pub struct App {
    library: Arc<dyn LibraryClient>,
    registry: Arc<dyn CardRegistry>,
    conversation: ConversationHandle,
    sidebar: SidebarModel,
    stage_title: String,
}

impl App {
    pub fn new(
        library: Arc<dyn LibraryClient>,
        registry: Arc<dyn CardRegistry>,
        conversation: ConversationHandle,
    ) -> Self {
        Self {
            library,
            registry,
            conversation,
            sidebar: SidebarModel::new(),
            stage_title: WELCOME_TITLE.to_string(),
        }
    }

    pub fn stage_title(&self) -> &str {
        &self.stage_title
    }

    pub fn sidebar(&self) -> &SidebarModel {
        &self.sidebar
    }

    fn stage(&self) -> String {
        console::render_stage(
            &self.stage_title,
            &self.registry.cards(),
            self.registry.focus_mode(),
        )
    }

    fn backend_failed(&mut self, err: &LibraryError) -> String {
        error!(error = %err, "Backend request failed.");
        self.stage_title = BACKEND_ERROR_TITLE.to_string();
        format!("{BACKEND_ERROR_TITLE}\n  ({err})")
    }

    pub async fn execute(&mut self, command: Command) -> (Flow, String) {
        let output = match command {
            Command::Books => self.refresh_library().await,
            Command::Open(key) => self.open_book(&key).await,
            Command::Upload(path) => self.upload(path).await,
            Command::Talk(card) => self.send_to_card(card, |h, c| h.talk(c)),
            Command::Close(card) => self.send_to_card(card, |h, c| h.close(c)),
            Command::Cards => self.stage(),
            Command::Help => HELP.to_string(),
            Command::Quit => return (Flow::Quit, String::new()),
        };
        (Flow::Continue, output)
    }

    #[instrument(skip(self))]
    pub async fn refresh_library(&mut self) -> String {
        match self.library.list_books().await {
            Ok(ids) => {
                let added = self.sidebar.extend_from_listing(&ids);
                info!(listed = ids.len(), added, "Library refreshed.");
                console::render_sidebar(&self.sidebar)
            }
            Err(e) => self.backend_failed(&e),
        }
    }

    /// Loads a cast by sidebar position or book id.
    #[instrument(skip(self))]
    pub async fn open_book(&mut self, key: &str) -> String {
        let book_id = self
            .sidebar
            .resolve(key)
            .map(|entry| entry.book_id.clone())
            .unwrap_or_else(|| key.to_string());

        self.clear_stage().await;
        self.stage_title = CASTING_TITLE.to_string();
        match self.library.fetch_cast(&book_id).await {
            Ok(book) => {
                self.sidebar.insert(&book.book_id);
                self.mount(book)
            }
            Err(e) => self.backend_failed(&e),
        }
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn upload(&mut self, path: PathBuf) -> String {
        match self.library.upload(&path).await {
            Ok(book) => {
                self.sidebar.promote_upload(&book.book_id, &book.title);
                self.clear_stage().await;
                self.mount(book)
            }
            Err(e @ LibraryError::Backend(_)) => self.backend_failed(&e),
            Err(e) => {
                warn!(error = %e, "Upload rejected.");
                format!("Upload failed: {e}")
            }
        }
    }

    /// Ends any conversation and unmounts every card.
    async fn clear_stage(&mut self) {
        self.conversation.close_all().await;
        self.registry.unmount_all();
    }

    fn mount(&mut self, book: Book) -> String {
        self.stage_title = format!("Cast of {}", book.title);
        for character in book.characters {
            self.registry.mount(character);
        }
        self.stage()
    }

    fn send_to_card(
        &self,
        card: CardId,
        send: impl FnOnce(&ConversationHandle, CardId) -> bool,
    ) -> String {
        if self.registry.card(card).is_none() {
            return format!("There is no card {card}.");
        }
        if send(&self.conversation, card) {
            String::new()
        } else {
            "The conversation controller has stopped.".to_string()
        }
    }
}
