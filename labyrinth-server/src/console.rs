//! The operator console: a line interpreter on its own worker thread with
//! non-canonical stdin so the shutdown flag can interrupt a read within one
//! poll period. Log lines that arrive while a command is being typed are
//! re-drawn above the prompt, the prompt itself stays intact.

use crate::dispatch::Dispatcher;
use crate::engine::GameEngine;
use crate::registry::PlayerRegistry;
use protocol::{GridPos, ItemKind};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// The prompt shown in front of the input line.
const PROMPT: &str = "> ";
/// Poll period for stdin, keeps shutdown latency below ~50 ms.
const POLL_MILLIS: i32 = 50;
/// Executed lines kept for inspection.
const HISTORY_CAP: usize = 1000;

// Administrative levels, see the command table.
pub const LEVEL_MODERATOR: u8 = 1;
pub const LEVEL_ADMIN: u8 = 2;
pub const LEVEL_SUPER: u8 = 3;

/// What a command execution reports back to the operator.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        CommandOutcome {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        CommandOutcome {
            success: false,
            message: message.into(),
        }
    }
}

/// Everything the commands need to reach.
pub struct ConsoleContext {
    pub engine: Arc<Mutex<GameEngine>>,
    pub registry: Arc<Mutex<PlayerRegistry>>,
    pub dispatcher: Arc<Dispatcher>,
}

// ===================================================================
// Prompt-aware log sink.
// ===================================================================

struct PromptState {
    /// Set while the input loop owns the terminal line.
    active: bool,
    buffer: String,
}

/// Shared between the tracing layer and the input thread. Whoever writes a
/// log line while the prompt is active clears the line, prints the log and
/// paints the prompt again underneath.
#[derive(Clone)]
pub struct ConsoleSink {
    state: Arc<StdMutex<PromptState>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        ConsoleSink {
            state: Arc::new(StdMutex::new(PromptState {
                active: false,
                buffer: String::new(),
            })),
        }
    }

    fn emit(&self, bytes: &[u8]) {
        let state = self.state.lock().unwrap();
        let mut stdout = std::io::stdout().lock();
        if state.active {
            let _ = stdout.write_all(b"\r\x1b[K");
            let _ = stdout.write_all(bytes);
            let _ = write!(stdout, "{PROMPT}{}", state.buffer);
        } else {
            let _ = stdout.write_all(bytes);
        }
        let _ = stdout.flush();
    }

    fn set_active(&self, active: bool) {
        self.state.lock().unwrap().active = active;
    }

    fn set_buffer(&self, buffer: &str) {
        let mut state = self.state.lock().unwrap();
        state.buffer.clear();
        state.buffer.push_str(buffer);
    }

    /// Repaints the prompt line after an edit.
    fn redraw_prompt(&self) {
        let state = self.state.lock().unwrap();
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\r\x1b[K{PROMPT}{}", state.buffer);
        let _ = stdout.flush();
    }
}

/// A buffering writer so one formatted tracing event is emitted as one
/// atomic console line.
pub struct SinkWriter {
    sink: ConsoleSink,
    pending: Vec<u8>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.sink.emit(&self.pending);
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ConsoleSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self.clone(),
            pending: Vec::new(),
        }
    }
}

// ===================================================================
// Raw mode.
// ===================================================================

/// Puts stdin into non-canonical, non-echoing mode and restores the old
/// settings on drop. A no-op when stdin is not a terminal.
struct RawModeGuard {
    original: Option<libc::termios>,
}

impl RawModeGuard {
    fn enable() -> Self {
        // Safety: plain termios calls on fd 0.
        unsafe {
            if libc::isatty(0) == 0 {
                return RawModeGuard { original: None };
            }
            let mut termios = std::mem::zeroed::<libc::termios>();
            if libc::tcgetattr(0, &mut termios) != 0 {
                return RawModeGuard { original: None };
            }
            let original = termios;
            termios.c_lflag &= !(libc::ICANON | libc::ECHO);
            termios.c_cc[libc::VMIN] = 0;
            termios.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(0, libc::TCSANOW, &termios) != 0 {
                return RawModeGuard { original: None };
            }
            RawModeGuard {
                original: Some(original),
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original {
            unsafe {
                libc::tcsetattr(0, libc::TCSANOW, &original);
            }
        }
    }
}

/// Waits up to one poll period for stdin to become readable.
fn stdin_readable() -> bool {
    let mut descriptor = libc::pollfd {
        fd: 0,
        events: libc::POLLIN,
        revents: 0,
    };
    // Safety: one descriptor, bounded timeout.
    let ready = unsafe { libc::poll(&mut descriptor, 1, POLL_MILLIS) };
    ready > 0 && descriptor.revents & libc::POLLIN != 0
}

// ===================================================================
// Input loop.
// ===================================================================

/// Spawns the console worker thread. It polls stdin in short intervals so
/// the shutdown flag is honored promptly, executes finished lines on the
/// runtime and keeps a bounded history.
pub fn spawn_console(
    context: ConsoleContext,
    sink: ConsoleSink,
    runtime: tokio::runtime::Handle,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || input_loop(context, sink, runtime, shutdown))
        .expect("spawning the console thread")
}

fn input_loop(
    context: ConsoleContext,
    sink: ConsoleSink,
    runtime: tokio::runtime::Handle,
    shutdown: Arc<AtomicBool>,
) {
    let _raw = RawModeGuard::enable();
    let mut history: VecDeque<String> = VecDeque::new();
    let mut line = String::new();
    sink.set_active(true);
    sink.redraw_prompt();

    while !shutdown.load(Ordering::Relaxed) {
        if !stdin_readable() {
            continue;
        }
        let mut byte = [0u8; 1];
        let read = unsafe { libc::read(0, byte.as_mut_ptr().cast(), 1) };
        if read <= 0 {
            continue;
        }
        match byte[0] {
            b'\r' | b'\n' => {
                let entered = std::mem::take(&mut line);
                sink.set_buffer("");
                let trimmed = entered.trim();
                if trimmed.is_empty() {
                    sink.redraw_prompt();
                    continue;
                }
                if history.len() == HISTORY_CAP {
                    history.pop_front();
                }
                history.push_back(trimmed.to_string());
                sink.emit(b"\n");
                let outcome =
                    runtime.block_on(execute_command(&context, "console", trimmed));
                let marker = if outcome.success { "ok" } else { "error" };
                sink.emit(format!("[{marker}] {}\n", outcome.message).as_bytes());
                sink.redraw_prompt();
            }
            // Backspace in both flavors.
            0x7f | 0x08 => {
                line.pop();
                sink.set_buffer(&line);
                sink.redraw_prompt();
            }
            byte if byte.is_ascii_graphic() || byte == b' ' => {
                line.push(byte as char);
                sink.set_buffer(&line);
                sink.redraw_prompt();
            }
            _ => {}
        }
    }

    sink.set_active(false);
    tracing::info!(executed = history.len(), "Console drained.");
}

// ===================================================================
// Parsing and execution.
// ===================================================================

/// Splits a command line into whitespace-separated tokens with optional
/// double-quoted spans.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for character in line.chars() {
        match character {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The minimum level needed per command. Unknown commands are rejected later.
fn required_level(command: &str) -> u8 {
    match command {
        "help" => 0,
        "kick" | "kill" | "system" | "players" => LEVEL_MODERATOR,
        "give" | "tp" | "coin" => LEVEL_ADMIN,
        "clear" | "restart" | "admin" => LEVEL_SUPER,
        _ => 0,
    }
}

const HELP_TEXT: &str = "\
give <playerId> <item> [count]  put items (or the pseudo-item coin) into a pocket
tp <playerId> <x> <y> <z>       teleport to a cell
kick <playerId> [reason]        log out and close the connection
kill <playerId>                 respawn somewhere random
clear                           reset the match
coin <playerId> <amount>        set match coins and mirror to the durable total
system <message>                broadcast an announcement
admin <playerId> <level 0..3>   change an administrative level
players                         list who is online
restart                         reset the match
help                            this text";

/// Runs one operator line on behalf of `user` and reports the outcome.
pub async fn execute_command(
    context: &ConsoleContext,
    user: &str,
    line: &str,
) -> CommandOutcome {
    let tokens = tokenize(line);
    let Some(command) = tokens.first().map(String::as_str) else {
        return CommandOutcome::fail("empty command");
    };
    let arguments = &tokens[1..];

    let level = {
        let engine = context.engine.lock().await;
        engine.admin_level(user)
    };
    if level < required_level(command) {
        return CommandOutcome::fail(format!("{command} needs level {}", required_level(command)));
    }

    match command {
        "help" => CommandOutcome::ok(HELP_TEXT),

        "players" => {
            let registry = context.registry.lock().await;
            let online = registry.online();
            if online.is_empty() {
                CommandOutcome::ok("nobody online")
            } else {
                CommandOutcome::ok(online.join(", "))
            }
        }

        "give" => {
            let [player_id, item, rest @ ..] = arguments else {
                return CommandOutcome::fail("usage: give <playerId> <item> [count]");
            };
            let count: u32 = match rest.first() {
                None => 1,
                Some(raw) => match raw.parse() {
                    Ok(count) => count,
                    Err(_) => return CommandOutcome::fail("count must be a number"),
                },
            };
            if item == "coin" {
                // The pseudo-item goes to the durable total only.
                let mut registry = context.registry.lock().await;
                match registry.add_total_coins(player_id, count as i64) {
                    Ok(total) => CommandOutcome::ok(format!("{player_id} now owns {total} coins")),
                    Err(reason) => CommandOutcome::fail(reason),
                }
            } else {
                let Some(kind) = ItemKind::parse(item) else {
                    return CommandOutcome::fail(format!("unknown item {item}"));
                };
                let mut engine = context.engine.lock().await;
                match engine.give(player_id, kind, count) {
                    Ok(()) => CommandOutcome::ok(format!(
                        "gave {count} {} to {player_id}",
                        kind.wire_name()
                    )),
                    Err(err) => CommandOutcome::fail(err.to_string()),
                }
            }
        }

        "tp" => {
            let [player_id, x, y, z] = arguments else {
                return CommandOutcome::fail("usage: tp <playerId> <x> <y> <z>");
            };
            let (Ok(x), Ok(y), Ok(z)) = (x.parse(), y.parse(), z.parse()) else {
                return CommandOutcome::fail("coordinates must be integers");
            };
            let result = {
                let mut engine = context.engine.lock().await;
                engine.teleport(player_id, GridPos::new(x, y, z))
            };
            match result {
                Ok(position) => {
                    context.dispatcher.announce_player_position(player_id, position);
                    CommandOutcome::ok(format!("moved {player_id} to ({x}, {y}, {z})"))
                }
                Err(err) => CommandOutcome::fail(err.to_string()),
            }
        }

        "kick" => {
            let [player_id, reason @ ..] = arguments else {
                return CommandOutcome::fail("usage: kick <playerId> [reason]");
            };
            let reason = if reason.is_empty() {
                "kicked by operator".to_string()
            } else {
                reason.join(" ")
            };
            if context.dispatcher.kick(player_id, &reason).await {
                CommandOutcome::ok(format!("kicked {player_id}"))
            } else {
                CommandOutcome::fail(format!("{player_id} has no connection"))
            }
        }

        "kill" => {
            let [player_id] = arguments else {
                return CommandOutcome::fail("usage: kill <playerId>");
            };
            let result = {
                let mut engine = context.engine.lock().await;
                engine.kill(player_id)
            };
            match result {
                Ok(position) => {
                    context.dispatcher.announce_player_position(player_id, position);
                    CommandOutcome::ok(format!("{player_id} respawned"))
                }
                Err(err) => CommandOutcome::fail(err.to_string()),
            }
        }

        "clear" | "restart" => {
            {
                let mut engine = context.engine.lock().await;
                engine.reset();
            }
            context.dispatcher.broadcast_maze().await;
            context.dispatcher.system_chat("The match was reset.").await;
            CommandOutcome::ok("match reset")
        }

        "coin" => {
            let [player_id, amount] = arguments else {
                return CommandOutcome::fail("usage: coin <playerId> <amount>");
            };
            let Ok(amount) = amount.parse::<u32>() else {
                return CommandOutcome::fail("amount must be a number");
            };
            let result = {
                let mut engine = context.engine.lock().await;
                engine.set_coins(player_id, amount)
            };
            if let Err(err) = result {
                return CommandOutcome::fail(err.to_string());
            }
            let mut registry = context.registry.lock().await;
            if let Err(reason) = registry.set_total_coins(player_id, amount as u64) {
                return CommandOutcome::fail(reason);
            }
            CommandOutcome::ok(format!("{player_id} now has {amount} coins"))
        }

        "system" => {
            if arguments.is_empty() {
                return CommandOutcome::fail("usage: system <message>");
            }
            let message = arguments.join(" ");
            context.dispatcher.system_chat(&message).await;
            CommandOutcome::ok("announced")
        }

        "admin" => {
            let [player_id, level] = arguments else {
                return CommandOutcome::fail("usage: admin <playerId> <level 0..3>");
            };
            let Ok(level) = level.parse::<u8>() else {
                return CommandOutcome::fail("level must be 0..3");
            };
            if level > LEVEL_SUPER {
                return CommandOutcome::fail("level must be 0..3");
            }
            let mut engine = context.engine.lock().await;
            engine.set_admin_level(player_id, level);
            CommandOutcome::ok(format!("{player_id} is now level {level}"))
        }

        unknown => CommandOutcome::fail(format!("unknown command {unknown}, try help")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::persistence::Persistence;
    use protocol::{CellKind, CoinSpot, MazeData};

    fn test_maze() -> MazeData {
        let mut cells = vec![vec![vec![CellKind::Wall; 5]; 5]; 1];
        for y in 1..4 {
            for x in 1..4 {
                cells[0][y][x] = CellKind::Path;
            }
        }
        cells[0][1][1] = CellKind::Start;
        cells[0][3][3] = CellKind::End;
        MazeData {
            width: 5,
            height: 5,
            layers: 1,
            cells,
            start: GridPos::new(1, 1, 0),
            end: GridPos::new(3, 3, 0),
            coin_positions: vec![CoinSpot {
                position: GridPos::new(2, 1, 0),
                collected: false,
            }],
        }
    }

    async fn context() -> (tempfile::TempDir, ConsoleContext) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Mutex::new(GameEngine::new(test_maze())));
        let registry = Arc::new(Mutex::new(PlayerRegistry::new()));
        let broadcaster = Arc::new(Broadcaster::new());
        let persistence = Arc::new(Persistence::new(dir.path()));
        persistence.ensure_layout().await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            registry.clone(),
            broadcaster,
            persistence,
        ));
        (
            dir,
            ConsoleContext {
                engine,
                registry,
                dispatcher,
            },
        )
    }

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(tokenize("give P coin 5"), vec!["give", "P", "coin", "5"]);
        assert_eq!(
            tokenize(r#"system "server goes down soon""#),
            vec!["system", "server goes down soon"]
        );
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[tokio::test]
    async fn unknown_commands_fail_with_a_reason() {
        let (_dir, context) = context().await;
        let outcome = execute_command(&context, "console", "frobnicate").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("unknown command"));
    }

    #[tokio::test]
    async fn levels_gate_the_commands() {
        let (_dir, context) = context().await;
        // An unprivileged user cannot reset the match.
        let outcome = execute_command(&context, "PLAYER_000001", "clear").await;
        assert!(!outcome.success);
        // The console pseudo-user is super-admin.
        let outcome = execute_command(&context, "console", "clear").await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn admin_command_promotes_players() {
        let (_dir, context) = context().await;
        let outcome = execute_command(&context, "console", "admin PLAYER_000042 2").await;
        assert!(outcome.success);
        {
            let mut engine = context.engine.lock().await;
            engine.add_player("PLAYER_000042", "X").unwrap();
            assert_eq!(engine.admin_level("PLAYER_000042"), 2);
        }
        // Level 2 may give items but may not promote.
        let outcome =
            execute_command(&context, "PLAYER_000042", "give PLAYER_000042 hammer").await;
        assert!(outcome.success);
        let outcome = execute_command(&context, "PLAYER_000042", "admin PLAYER_000042 3").await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn coin_command_updates_runtime_and_durable_state() {
        let (_dir, context) = context().await;
        let player_id = {
            let mut registry = context.registry.lock().await;
            registry
                .register_or_resolve("aa:bb:cc:dd:ee:ff", "Tester")
                .unwrap()
        };
        {
            let mut engine = context.engine.lock().await;
            engine.add_player(&player_id, "Tester").unwrap();
        }
        let outcome =
            execute_command(&context, "console", &format!("coin {player_id} 100")).await;
        assert!(outcome.success, "{}", outcome.message);
        let engine = context.engine.lock().await;
        assert_eq!(engine.player(&player_id).unwrap().coins, 100);
        drop(engine);
        let registry = context.registry.lock().await;
        assert_eq!(registry.get(&player_id).unwrap().total_coins, 100);
    }

    #[tokio::test]
    async fn give_coin_touches_only_the_durable_total() {
        let (_dir, context) = context().await;
        let player_id = {
            let mut registry = context.registry.lock().await;
            registry
                .register_or_resolve("aa:bb:cc:dd:ee:ff", "Tester")
                .unwrap()
        };
        {
            let mut engine = context.engine.lock().await;
            engine.add_player(&player_id, "Tester").unwrap();
        }
        let outcome =
            execute_command(&context, "console", &format!("give {player_id} coin 25")).await;
        assert!(outcome.success);
        let registry = context.registry.lock().await;
        assert_eq!(registry.get(&player_id).unwrap().total_coins, 25);
        drop(registry);
        let engine = context.engine.lock().await;
        assert_eq!(engine.player(&player_id).unwrap().coins, 0);
    }

    #[tokio::test]
    async fn tp_rejects_walls() {
        let (_dir, context) = context().await;
        {
            let mut engine = context.engine.lock().await;
            engine.add_player("P", "P").unwrap();
        }
        let outcome = execute_command(&context, "console", "tp P 0 0 0").await;
        assert!(!outcome.success);
        let outcome = execute_command(&context, "console", "tp P 2 2 0").await;
        assert!(outcome.success);
    }
}
