//! Game process spawning and log monitoring.
//!
//! The game outputs log4j XML events on stdout when a logging configuration
//! is installed, these are decoded incrementally and re-emitted as
//! structured log lines. Output that is not valid XML passes through as
//! plain stdout lines.

use std::path::PathBuf;
use std::io;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::args;


/// A fully synthesized game launch, ready to spawn.
#[derive(Debug, Clone)]
pub struct Game {
    /// The Java executable to run.
    pub exec: PathBuf,
    pub jvm_args: Vec<String>,
    pub main_class: String,
    pub game_args: Vec<String>,
    /// The working directory of the process.
    pub work_dir: PathBuf,
}

/// The lifecycle of a monitored game process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Spawning,
    Running,
    Exited,
}

/// An event of a monitored game process.
#[derive(Debug)]
pub enum GameEvent {
    /// A plain stdout line that is not part of an XML log stream.
    Stdout(String),
    /// A plain stderr line.
    Stderr(String),
    /// A structured log event decoded from the XML log stream.
    Log(LogLine),
    /// The process has exited, this is always the last event.
    Exited {
        code: Option<i32>,
        /// True when the process did not exit with a zero code.
        crashed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

/// A structured log event of the game.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub logger: String,
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub thread: String,
    pub message: String,
    pub throwable: Option<String>,
}

impl Default for LogLine {
    fn default() -> Self {
        Self {
            logger: String::new(),
            time: DateTime::UNIX_EPOCH,
            level: LogLevel::default(),
            thread: String::new(),
            message: String::new(),
            throwable: None,
        }
    }
}

impl Game {

    pub fn new(exec: PathBuf, command: args::Command, work_dir: PathBuf) -> Self {
        Self {
            exec,
            jvm_args: command.jvm_args,
            main_class: command.main_class,
            game_args: command.game_args,
            work_dir,
        }
    }

    /// Create the process command, this command can be modified if needed.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.exec);
        command
            .current_dir(&self.work_dir)
            .args(&self.jvm_args)
            .arg(&self.main_class)
            .args(&self.game_args);
        command
    }

    /// Spawn the game and monitor it, the returned monitor yields events
    /// until the final [`GameEvent::Exited`].
    pub fn spawn(&self) -> io::Result<Monitor> {

        let mut command = self.command();
        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        let stdout = child.stdout.take().expect("stdout should be piped");
        let stderr = child.stderr.take().expect("stderr should be piped");

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {

            let mut stdout = BufReader::new(stdout).lines();
            let mut stderr = BufReader::new(stderr).lines();
            let mut stdout_open = true;
            let mut stderr_open = true;
            let mut parser = None::<XmlLogParser>;

            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout.next_line(), if stdout_open => {
                        match line {
                            Ok(Some(line)) => {

                                if parser.is_none() && line.trim_ascii_start().starts_with("<log4j:") {
                                    parser = Some(XmlLogParser::default());
                                }

                                if let Some(parser) = &mut parser {
                                    for log in parser.feed(&line) {
                                        if tx.send(GameEvent::Log(log)).await.is_err() {
                                            return;
                                        }
                                    }
                                } else if tx.send(GameEvent::Stdout(line)).await.is_err() {
                                    return;
                                }

                            }
                            _ => stdout_open = false,
                        }
                    }
                    line = stderr.next_line(), if stderr_open => {
                        match line {
                            Ok(Some(line)) => {
                                if tx.send(GameEvent::Stderr(line)).await.is_err() {
                                    return;
                                }
                            }
                            _ => stderr_open = false,
                        }
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };

            let crashed = code != Some(0);
            let _ = tx.send(GameEvent::Exited { code, crashed }).await;

        });

        Ok(Monitor {
            state: GameState::Spawning,
            events: rx,
        })

    }

}

/// A handle over a running game process, yielding its events.
#[derive(Debug)]
pub struct Monitor {
    state: GameState,
    events: mpsc::Receiver<GameEvent>,
}

impl Monitor {

    pub fn state(&self) -> GameState {
        self.state
    }

    /// Receive the next event of the process, none after the final
    /// [`GameEvent::Exited`] has been yielded. The first output event moves
    /// the state from spawning to running.
    pub async fn next_event(&mut self) -> Option<GameEvent> {
        let event = self.events.recv().await;
        match event {
            Some(GameEvent::Exited { .. }) => self.state = GameState::Exited,
            None => self.state = GameState::Exited,
            Some(_) => {
                if self.state == GameState::Spawning {
                    self.state = GameState::Running;
                }
            }
        }
        event
    }

}

/// Incremental parser for the stream of log4j XML events of the game.
///
/// The game writes one event across possibly many lines, so unparseable
/// tails are buffered and retried once more input arrives. Event assembly
/// itself is delegated to an [`EventBuilder`] living across feeds.
#[derive(Debug, Default)]
struct XmlLogParser {
    /// Stacked input while the end of it fails to parse.
    buffer: String,
    /// Fully assembled logs, drained on each feed.
    ready: Vec<LogLine>,
    /// The event currently being assembled, if any.
    building: Option<EventBuilder>,
}

impl XmlLogParser {

    /// Feed the given input into the parser, every fully assembled log is
    /// returned by the iterator.
    pub fn feed(&mut self, input: &str) -> impl Iterator<Item = LogLine> + '_ {

        use xmlparser::{Tokenizer, Token, ElementEnd};

        let full_input = if !self.buffer.is_empty() {
            self.buffer.push_str(input);
            &*self.buffer
        } else {
            input
        };

        let mut tokenizer = Tokenizer::from_fragment(full_input, 0..full_input.len());
        let mut stalled = false;
        let mut parsed_to = 0;

        for token in &mut tokenizer {

            let Ok(token) = token else {

                // The tail is incomplete, keep it for the next feed. When
                // already buffering, only the parsed head can be cut.
                if self.buffer.is_empty() {
                    self.buffer.push_str(&input[parsed_to..]);
                } else {
                    self.buffer.drain(..parsed_to);
                }

                stalled = true;
                break;

            };

            parsed_to = token.span().start() + token.span().len();

            match token {
                Token::ElementStart { prefix, local, .. } => {
                    match &mut self.building {
                        None if &*prefix == "log4j" && &*local == "Event" => {
                            self.building = Some(EventBuilder::default());
                        }
                        Some(builder) => builder.open_tag(&prefix, &local),
                        None => (),
                    }
                }
                Token::ElementEnd { end: ElementEnd::Close(prefix, local), .. } => {
                    if let Some(builder) = &mut self.building {
                        if builder.close_tag(&prefix, &local) {
                            let builder = self.building.take().unwrap();
                            self.ready.push(builder.log);
                        }
                    }
                }
                Token::Attribute { prefix, local, value, .. } => {
                    if let Some(builder) = &mut self.building {
                        if prefix.is_empty() {
                            builder.attribute(&local, &value);
                        }
                    }
                }
                Token::Text { text } |
                Token::Cdata { text, .. } => {
                    if let Some(builder) = &mut self.building {
                        builder.text(text.trim_ascii());
                    }
                }
                _ => (),
            }

        }

        if !stalled {
            // The whole input was consumed, nothing left to stack.
            self.buffer.clear();
        }

        self.ready.drain(..)

    }

}

/// One log event being assembled from its tokens, the event closing tag
/// completes it.
#[derive(Debug, Default)]
struct EventBuilder {
    log: LogLine,
    section: EventSection,
}

/// The part of the event element the builder is currently inside of.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum EventSection {
    #[default]
    Attributes,
    Message,
    Throwable,
}

impl EventBuilder {

    fn open_tag(&mut self, prefix: &str, local: &str) {
        if self.section == EventSection::Attributes && prefix == "log4j" {
            match local {
                "Message" => self.section = EventSection::Message,
                "Throwable" => self.section = EventSection::Throwable,
                _ => (),
            }
        }
    }

    /// Handle a closing tag, returning true once the whole event element
    /// is closed and the log is complete.
    fn close_tag(&mut self, prefix: &str, local: &str) -> bool {
        if prefix != "log4j" {
            return false;
        }
        match (self.section, local) {
            (EventSection::Attributes, "Event") => true,
            (EventSection::Message, "Message") |
            (EventSection::Throwable, "Throwable") => {
                self.section = EventSection::Attributes;
                false
            }
            _ => false,
        }
    }

    fn attribute(&mut self, local: &str, value: &str) {

        if self.section != EventSection::Attributes {
            return;
        }

        match local {
            "logger" => self.log.logger = value.to_string(),
            "timestamp" => {
                let timestamp = value.parse::<i64>().unwrap_or(0);
                self.log.time = DateTime::from_timestamp_millis(timestamp)
                    .unwrap_or(DateTime::UNIX_EPOCH);
            }
            "level" => {
                self.log.level = match value {
                    "TRACE" => LogLevel::Trace,
                    "DEBUG" => LogLevel::Debug,
                    "INFO" => LogLevel::Info,
                    "WARN" => LogLevel::Warn,
                    "ERROR" => LogLevel::Error,
                    "FATAL" => LogLevel::Fatal,
                    _ => return,
                };
            }
            "thread" => self.log.thread = value.to_string(),
            _ => (),
        }

    }

    fn text(&mut self, text: &str) {
        match self.section {
            EventSection::Message => self.log.message = text.to_string(),
            EventSection::Throwable => self.log.throwable = Some(text.to_string()),
            EventSection::Attributes => (),
        }
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn xml_log_single_event() {

        let mut parser = XmlLogParser::default();
        let logs = parser.feed(concat!(
            r#"<log4j:Event logger="net.minecraft.client" timestamp="1700000000000" level="WARN" thread="Render thread">"#,
            r#"<log4j:Message><![CDATA[Shader recompiled]]></log4j:Message>"#,
            r#"</log4j:Event>"#,
        )).collect::<Vec<_>>();

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].logger, "net.minecraft.client");
        assert_eq!(logs[0].level, LogLevel::Warn);
        assert_eq!(logs[0].thread, "Render thread");
        assert_eq!(logs[0].message, "Shader recompiled");
        assert_eq!(logs[0].time, DateTime::from_timestamp_millis(1700000000000).unwrap());
        assert!(logs[0].throwable.is_none());

    }

    #[test]
    fn xml_log_fragmented_event() {

        let mut parser = XmlLogParser::default();

        // The event arrives cut in the middle of a tag, the first feeds
        // yield nothing.
        let logs = parser.feed(r#"<log4j:Event logger="net.minecraft" timestamp="0" level="ERROR" thread="main">"#).collect::<Vec<_>>();
        assert!(logs.is_empty());

        let logs = parser.feed(r#"<log4j:Message>Boom</log4j:Message><log4j:Thro"#).collect::<Vec<_>>();
        assert!(logs.is_empty());

        let logs = parser.feed(r#"wable>java.lang.IllegalStateException</log4j:Throwable></log4j:Event>"#).collect::<Vec<_>>();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].message, "Boom");
        assert_eq!(logs[0].throwable.as_deref(), Some("java.lang.IllegalStateException"));

    }

    #[test]
    fn xml_log_consecutive_events() {

        let mut parser = XmlLogParser::default();
        let logs = parser.feed(concat!(
            r#"<log4j:Event logger="a" timestamp="0" level="INFO" thread="main"><log4j:Message>first</log4j:Message></log4j:Event>"#,
            r#"<log4j:Event logger="b" timestamp="0" level="INFO" thread="main"><log4j:Message>second</log4j:Message></log4j:Event>"#,
        )).collect::<Vec<_>>();

        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");

    }

}
