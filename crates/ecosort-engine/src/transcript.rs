use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ecosort_contracts::chat::detect_image_urls;

/// Fixed greeting shown as the only entry of a fresh conversation.
pub const WELCOME_MESSAGE: &str = "¡Hola! 👋 Soy tu asistente de reciclaje. Envíame una foto o la URL de una imagen y te diré qué material es y cómo debes desecharlo.";

/// Placeholder text shown while an analysis request is in flight.
pub const BUSY_MESSAGE: &str = "Analizando con IA...";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Welcome,
    User,
    Bot,
    /// Transient placeholder, removed when the reply (or the error) lands.
    Busy,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevealMarker {
    /// Rendered in full when the entry was added.
    Instant,
    /// A typed reveal currently owns the entry.
    Revealing,
    /// The reveal ran to the end of the text.
    Complete,
    /// The reveal was cancelled; the text holds the revealed prefix.
    Truncated,
}

/// One image tag on a user turn, shown with a 1-based number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserImage {
    pub display: String,
    pub from_file: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub id: u64,
    pub kind: EntryKind,
    pub text: String,
    pub images: Vec<UserImage>,
    pub reveal: RevealMarker,
}

/// Render sink for the transcript. The engine mutates the model and tells
/// the view what changed; the CLI prints, tests record.
pub trait TranscriptView: Send + Sync {
    fn entry_added(&self, entry: &Entry);
    fn entry_removed(&self, id: u64, kind: EntryKind);
    fn reveal_started(&self, id: u64);
    fn reveal_char(&self, id: u64, ch: char);
    fn reveal_finished(&self, id: u64, complete: bool);
    fn transcript_cleared(&self);
}

/// Sink that drops everything, for headless use.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullView;

impl TranscriptView for NullView {
    fn entry_added(&self, _entry: &Entry) {}
    fn entry_removed(&self, _id: u64, _kind: EntryKind) {}
    fn reveal_started(&self, _id: u64) {}
    fn reveal_char(&self, _id: u64, _ch: char) {}
    fn reveal_finished(&self, _id: u64, _complete: bool) {}
    fn transcript_cleared(&self) {}
}

pub struct Transcript {
    entries: Vec<Entry>,
    next_id: u64,
    view: Arc<dyn TranscriptView>,
}

impl Transcript {
    /// A new transcript holds exactly the welcome entry.
    pub fn new(view: Arc<dyn TranscriptView>) -> Self {
        let mut transcript = Self {
            entries: Vec::new(),
            next_id: 1,
            view,
        };
        transcript.push(
            EntryKind::Welcome,
            WELCOME_MESSAGE.to_string(),
            Vec::new(),
            RevealMarker::Instant,
        );
        transcript
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_welcome_only(&self) -> bool {
        self.entries.len() == 1 && self.entries[0].kind == EntryKind::Welcome
    }

    pub fn push_user(&mut self, text: &str, images: Vec<UserImage>) -> u64 {
        self.push(
            EntryKind::User,
            text.to_string(),
            images,
            RevealMarker::Instant,
        )
    }

    pub fn push_bot(&mut self, text: &str) -> u64 {
        self.push(
            EntryKind::Bot,
            text.to_string(),
            Vec::new(),
            RevealMarker::Instant,
        )
    }

    pub fn push_busy(&mut self) -> u64 {
        self.push(
            EntryKind::Busy,
            BUSY_MESSAGE.to_string(),
            Vec::new(),
            RevealMarker::Instant,
        )
    }

    /// Open an empty bot entry for a typed reveal. Characters arrive via
    /// [`Transcript::append_reveal_char`].
    pub fn begin_bot_entry(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            kind: EntryKind::Bot,
            text: String::new(),
            images: Vec::new(),
            reveal: RevealMarker::Revealing,
        });
        self.view.reveal_started(id);
        id
    }

    pub fn append_reveal_char(&mut self, id: u64, ch: char) {
        let appended = match self.entry_mut(id) {
            Some(entry) if entry.reveal == RevealMarker::Revealing => {
                entry.text.push(ch);
                true
            }
            _ => false,
        };
        if appended {
            self.view.reveal_char(id, ch);
        }
    }

    /// Seal a revealing entry. `complete` distinguishes a reveal that ran
    /// to the end from a cancelled one whose text is the prefix so far.
    pub fn finish_reveal(&mut self, id: u64, complete: bool) {
        let marker = if complete {
            RevealMarker::Complete
        } else {
            RevealMarker::Truncated
        };
        let sealed = match self.entry_mut(id) {
            Some(entry) if entry.reveal == RevealMarker::Revealing => {
                entry.reveal = marker;
                true
            }
            _ => false,
        };
        if sealed {
            self.view.reveal_finished(id, complete);
        }
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(position) => {
                let entry = self.entries.remove(position);
                self.view.entry_removed(id, entry.kind);
                true
            }
            None => false,
        }
    }

    pub fn reset_to_welcome(&mut self) {
        self.entries.clear();
        self.view.transcript_cleared();
        self.push(
            EntryKind::Welcome,
            WELCOME_MESSAGE.to_string(),
            Vec::new(),
            RevealMarker::Instant,
        );
    }

    fn push(
        &mut self,
        kind: EntryKind,
        text: String,
        images: Vec<UserImage>,
        reveal: RevealMarker,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            kind,
            text,
            images,
            reveal,
        });
        if let Some(entry) = self.entries.last() {
            self.view.entry_added(entry);
        }
        id
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }
}

/// One staged attachment in the composer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StagedImage {
    File { path: PathBuf, name: String },
    Url { url: String },
}

impl StagedImage {
    pub fn display(&self) -> &str {
        match self {
            StagedImage::File { name, .. } => name,
            StagedImage::Url { url } => url,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, StagedImage::File { .. })
    }
}

/// The composer's attachment strip. Items keep their staging order for
/// listing and removal; sending reorders them files first, then URLs.
#[derive(Debug, Default)]
pub struct StagedImages {
    items: Vec<StagedImage>,
}

impl StagedImages {
    /// Stage a local image file. The path must exist and carry an
    /// extension the image crate recognizes.
    pub fn attach_file(&mut self, path: &Path) -> Result<String> {
        if !path.is_file() {
            bail!("{} is not a readable file", path.display());
        }
        image::ImageFormat::from_path(path)
            .with_context(|| format!("{} is not a recognized image format", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("imagen")
            .to_string();
        self.items.push(StagedImage::File {
            path: path.to_path_buf(),
            name: name.clone(),
        });
        Ok(name)
    }

    /// Mirror the composer text: URL refs whose address left the text are
    /// dropped, addresses newly present are staged once.
    pub fn sync_urls_with_text(&mut self, text: &str) {
        let urls = detect_image_urls(text);
        self.items.retain(|item| match item {
            StagedImage::Url { url } => urls.iter().any(|candidate| candidate == url),
            StagedImage::File { .. } => true,
        });
        for url in urls {
            let already_staged = self
                .items
                .iter()
                .any(|item| matches!(item, StagedImage::Url { url: staged } if *staged == url));
            if !already_staged {
                self.items.push(StagedImage::Url { url });
            }
        }
    }

    /// Remove by the 1-based number shown in the listing.
    pub fn remove(&mut self, index: usize) -> Option<StagedImage> {
        if index == 0 || index > self.items.len() {
            return None;
        }
        Some(self.items.remove(index - 1))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Staging order, as listed in the composer strip.
    pub fn iter(&self) -> impl Iterator<Item = &StagedImage> {
        self.items.iter()
    }

    /// Send order: file images first, then URL images, each group in
    /// staging order. Image numbers on the rendered turn follow this.
    pub fn ordered_for_send(&self) -> (Vec<PathBuf>, Vec<String>) {
        let files = self
            .items
            .iter()
            .filter_map(|item| match item {
                StagedImage::File { path, .. } => Some(path.clone()),
                StagedImage::Url { .. } => None,
            })
            .collect();
        let urls = self
            .items
            .iter()
            .filter_map(|item| match item {
                StagedImage::Url { url } => Some(url.clone()),
                StagedImage::File { .. } => None,
            })
            .collect();
        (files, urls)
    }

    /// The user-turn rendering of the staged set, in send order.
    pub fn sent_images(&self) -> Vec<UserImage> {
        let mut images: Vec<UserImage> = self
            .items
            .iter()
            .filter(|item| item.is_file())
            .map(|item| UserImage {
                display: item.display().to_string(),
                from_file: true,
            })
            .collect();
        images.extend(self.items.iter().filter(|item| !item.is_file()).map(|item| {
            UserImage {
                display: item.display().to_string(),
                from_file: false,
            }
        }));
        images
    }
}
