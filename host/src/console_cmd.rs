use anyhow::{bail, Context};
use msgs::chunk::{ChunkCoordinate, CompletionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCmd {
    Lock (ChunkCoordinate),
    Release (ChunkCoordinate),
    Set (ChunkCoordinate, CompletionStatus),
    Show (Option<ChunkCoordinate>),
    Peers,
    Locks,
    /// Last accepted edits, newest last.
    History (usize),
    Status,
    Save,
    Flush,
    Help,
    Quit,
}

pub const HELP: &str = "commands: lock <chunk>, release <chunk>, set <chunk> <empty|partial|complete>, show [chunk], peers, locks, history [n], status, save, flush, quit";

const DEFAULT_HISTORY: usize = 10;

impl ConsoleCmd {
    pub fn parse(input: &str) -> anyhow::Result<ConsoleCmd> {
        let (message_type, rem) = match input.find(' ') {
            Some(i) => (&input[..i], input[i+1..].trim()),
            None => (input, ""),
        };

        let chunk = |s: &str| -> anyhow::Result<ChunkCoordinate> {
            if s.is_empty() {
                bail!("missing chunk, e.g. C4");
            }
            s.parse()
        };

        let cmd = match message_type {
            "lock" => ConsoleCmd::Lock (chunk(rem)?),
            "release" => ConsoleCmd::Release (chunk(rem)?),
            "set" => {
                let (reference, status) = rem.rsplit_once(' ').context("usage: set <chunk> <status>")?;
                ConsoleCmd::Set (chunk(reference.trim())?, status.parse()?)
            }
            "show" => ConsoleCmd::Show (if rem.is_empty() { None } else { Some(chunk(rem)?) }),
            "peers" => ConsoleCmd::Peers,
            "locks" => ConsoleCmd::Locks,
            "history" => ConsoleCmd::History (if rem.is_empty() {
                DEFAULT_HISTORY
            }
            else {
                rem.parse().with_context(|| format!("not a count: {rem}"))?
            }),
            "status" => ConsoleCmd::Status,
            "save" => ConsoleCmd::Save,
            "flush" => ConsoleCmd::Flush,
            "help" | "?" => ConsoleCmd::Help,
            "quit" | "exit" => ConsoleCmd::Quit,
            _ => bail!("cmd not recognized"),
        };
        Ok(cmd)
    }
}
