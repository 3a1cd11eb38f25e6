use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tern_protocol::{MessageRole, SessionId, SessionRecord};
use tern_sync::{ChatEvent, ChatStore, Message, MessageStatus, SendRequest, SendState, SyncError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::command::{self, Command, HELP};
use super::settings::SettingsStore;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShellError {
    #[snafu(display("failed to read input on `{stage}`, {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Attachments collected for the next prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingAttachments {
    pub file_context: Option<String>,
    pub images: Vec<String>,
}

impl PendingAttachments {
    /// Builds the request for `content` and clears the attachments.
    pub fn take_request(&mut self, content: String, model: &str) -> SendRequest {
        let pending = std::mem::take(self);
        let mut request = SendRequest::new(content)
            .with_model(model)
            .with_images(pending.images);
        if let Some(file_context) = pending.file_context {
            request = request.with_file_context(file_context);
        }
        request
    }
}

enum Flow {
    Continue,
    Quit,
}

/// Line-oriented front end over a `ChatStore`.
pub struct Shell {
    store: ChatStore,
    settings: Arc<SettingsStore>,
    /// Model for new messages; starts from settings plus command-line overrides.
    model: String,
    pending: PendingAttachments,
    send_task: Option<JoinHandle<()>>,
}

impl Shell {
    pub fn new(store: ChatStore, settings: Arc<SettingsStore>, model: String) -> Self {
        Self {
            store,
            settings,
            model,
            pending: PendingAttachments::default(),
            send_task: None,
        }
    }

    pub async fn run(mut self) -> Result<(), ShellError> {
        let mut events = self.store.subscribe();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        match self.store.fetch_sessions().await {
            Ok(sessions) => print_sessions(&sessions, None),
            Err(error) => eprintln!("could not list sessions: {error}"),
        }
        println!("type /help for commands");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-line" })?;
                    let Some(line) = line else {
                        break;
                    };
                    if let Flow::Quit = self.handle_line(&line).await {
                        self.store.cancel_send();
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => render_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "display fell behind the event stream");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        if let Some(send_task) = self.send_task.take() {
            // Let the reply finish (or wind down after cancel) before exiting.
            let _ = send_task.await;
            while let Ok(event) = events.try_recv() {
                render_event(&event);
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let command = match command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(error) => {
                eprintln!("{error}");
                return Flow::Continue;
            }
        };

        if let Err(error) = self.handle(command).await {
            match &error {
                Handled::Sync(error) => {
                    tracing::debug!(error = %error, "command failed");
                    eprintln!("error: {error}");
                }
                Handled::Quit => return Flow::Quit,
                Handled::Message(message) => eprintln!("{message}"),
            }
        }
        Flow::Continue
    }

    async fn handle(&mut self, command: Command) -> Result<(), Handled> {
        match command {
            Command::List => {
                let sessions = self.store.fetch_sessions().await?;
                let active = self.store.snapshot().await.active_session_id();
                print_sessions(&sessions, active);
            }
            Command::New(title) => {
                let session = self.store.create_session(title.as_deref()).await?;
                println!("created session {} \"{}\"", session.id, session.title);
            }
            Command::Open(id) => {
                let session = self.store.load_session(id).await?;
                println!("== {} ({}) ==", session.title, session.id);
                for message in self.store.snapshot().await.transcript {
                    println!("{}", render_message(&message));
                }
            }
            Command::Rename(id, title) => {
                let session = self.store.rename_session(id, &title).await?;
                println!("renamed {} to \"{}\"", session.id, session.title);
            }
            Command::Summary(id) => {
                let id = self.target_session(id).await?;
                let session = self.store.generate_summary(id).await?;
                println!("session {} is now \"{}\"", session.id, session.title);
            }
            Command::Attach(path) => self.attach(&path).await?,
            Command::Image(url) => {
                self.pending.images.push(url);
                println!("{} image(s) attached to the next message", self.pending.images.len());
            }
            Command::Model(model) => {
                let mut settings = (*self.settings.settings()).clone();
                settings.default_model = model;
                if let Err(error) = self.settings.update(settings) {
                    return Err(Handled::Message(format!("could not save settings: {error}")));
                }
                self.model = self.settings.settings().default_model.clone();
                println!("default model is now {}", self.model);
            }
            Command::Cancel => {
                if !self.store.cancel_send() {
                    println!("nothing is streaming");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Err(Handled::Quit),
            Command::Prompt(content) => {
                self.send(content);
            }
        }
        Ok(())
    }

    async fn target_session(&self, id: Option<SessionId>) -> Result<SessionId, Handled> {
        match id {
            Some(id) => Ok(id),
            None => self
                .store
                .snapshot()
                .await
                .active_session_id()
                .ok_or_else(|| Handled::Message("no session is open".to_string())),
        }
    }

    async fn attach(&mut self, path: &Path) -> Result<(), Handled> {
        let bytes = tokio::fs::read(path).await.map_err(|error| {
            Handled::Message(format!("could not read {}: {error}", path.display()))
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let document = self.store.upload_file(&filename, bytes).await?;
        println!(
            "attached {filename} ({} characters extracted)",
            document.text.chars().count()
        );
        self.pending.file_context = Some(document.text);
        Ok(())
    }

    /// True while a spawned send has not finished, even before it reaches the store.
    fn send_running(&self) -> bool {
        self.store.is_sending()
            || self
                .send_task
                .as_ref()
                .is_some_and(|send_task| !send_task.is_finished())
    }

    /// Spawns a send for `content`. Returns `false` when another one is still running.
    fn send(&mut self, content: String) -> bool {
        if self.send_running() {
            eprintln!("a reply is still streaming, /cancel it first");
            return false;
        }

        let request = self.pending.take_request(content, &self.model);
        let store = self.store.clone();
        self.send_task = Some(tokio::spawn(async move {
            if let Err(error) = store.send_message(request).await {
                tracing::debug!(error = %error, "send failed");
                eprintln!("error: {error}");
            }
        }));
        true
    }
}

/// Why a command did not complete normally.
enum Handled {
    Sync(SyncError),
    Message(String),
    Quit,
}

impl From<SyncError> for Handled {
    fn from(error: SyncError) -> Self {
        Self::Sync(error)
    }
}

fn render_event(event: &ChatEvent) {
    let mut stdout = std::io::stdout().lock();
    let _ = match event {
        ChatEvent::SendStarted { .. } => write!(stdout, "assistant> "),
        ChatEvent::FragmentApplied { text, .. } => write!(stdout, "{text}"),
        ChatEvent::SendFinished { state, .. } => writeln!(stdout, "{}", finish_note(state)),
        ChatEvent::TitleChanged { session_id, title } => {
            writeln!(stdout, "[session {session_id} is now \"{title}\"]")
        }
        ChatEvent::DirectoryChanged | ChatEvent::TranscriptReplaced { .. } => Ok(()),
    };
    let _ = stdout.flush();
}

fn finish_note(state: &SendState) -> &'static str {
    match state {
        SendState::Completed | SendState::Failed { .. } => "",
        SendState::Cancelled => "\n[cancelled]",
        SendState::Abandoned => "\n[reply continued in a session that is no longer open]",
    }
}

pub fn render_message(message: &Message) -> String {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };
    let suffix = match message.status {
        MessageStatus::Cancelled => " [cancelled]",
        MessageStatus::Streaming | MessageStatus::Done | MessageStatus::Failed => "",
    };
    format!("{speaker}> {}{suffix}", message.content)
}

pub fn render_session_line(session: &SessionRecord, active: bool) -> String {
    let marker = if active { '*' } else { ' ' };
    format!(
        "{marker} {:>5}  {}  {}",
        session.id.get(),
        session.updated_at.format("%Y-%m-%d %H:%M"),
        session.title
    )
}

fn print_sessions(sessions: &[SessionRecord], active: Option<SessionId>) {
    if sessions.is_empty() {
        println!("no sessions yet, type a message to start one");
        return;
    }
    for session in sessions {
        println!("{}", render_session_line(session, Some(session.id) == active));
    }
}
