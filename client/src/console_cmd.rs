use anyhow::{bail, Context};
use msgs::chunk::{ChunkCoordinate, CompletionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCmd {
    Lock (ChunkCoordinate),
    Release (ChunkCoordinate),
    Set (ChunkCoordinate, CompletionStatus),
    /// Lock, set and release in one go.
    Mark (ChunkCoordinate, CompletionStatus),
    Show (Option<ChunkCoordinate>),
    Peers,
    Locks,
    Held,
    Hosts,
    Resync,
    Help,
    Quit,
}

pub const HELP: &str = "commands: lock <chunk>, release <chunk>, set <chunk> <status>, mark <chunk> <status>, show [chunk], peers, locks, held, hosts, resync, quit";

fn chunk_and_status(rem: &str, usage: &'static str) -> anyhow::Result<(ChunkCoordinate, CompletionStatus)> {
    let (reference, status) = rem.rsplit_once(' ').context(usage)?;
    Ok((reference.trim().parse()?, status.parse()?))
}

impl ConsoleCmd {
    pub fn parse(input: &str) -> anyhow::Result<ConsoleCmd> {
        let input = input.trim();
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
            "lock" | "edit" => ConsoleCmd::Lock (chunk(rem)?),
            "release" | "done" => ConsoleCmd::Release (chunk(rem)?),
            "set" => {
                let (c, status) = chunk_and_status(rem, "usage: set <chunk> <status>")?;
                ConsoleCmd::Set (c, status)
            }
            "mark" => {
                let (c, status) = chunk_and_status(rem, "usage: mark <chunk> <status>")?;
                ConsoleCmd::Mark (c, status)
            }
            "show" => ConsoleCmd::Show (if rem.is_empty() { None } else { Some(chunk(rem)?) }),
            "peers" => ConsoleCmd::Peers,
            "locks" => ConsoleCmd::Locks,
            "held" => ConsoleCmd::Held,
            "hosts" => ConsoleCmd::Hosts,
            "resync" => ConsoleCmd::Resync,
            "help" | "?" => ConsoleCmd::Help,
            "quit" | "exit" => ConsoleCmd::Quit,
            _ => bail!("cmd not recognized, try help"),
        };
        Ok(cmd)
    }
}
