/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use anyhow::{bail, Context, Result};
use chessie::{Color, Move};
use uci_parser::{UciCommand, UciInfo, UciOption, UciParseError, UciResponse};

use crate::{
    parse_move, to_san, CenterPolicy, ChessBoard, Cli, EngineCommand, Evaluator, RulesProvider,
    Search, SearchConfig, SearchError, SearchResult, BENCHMARK_FENS, DEFAULT_DEPTH, DEFAULT_WIDTH,
    ENGINE_NAME,
};

/// Default number of rounds at which to run the benchmark searches.
const BENCH_DEPTH: usize = 3;

/// Largest value accepted for the `Width` and `Depth` options.
const MAX_SPIN: usize = 256;

/// Outcome of a search thread.
type SearchOutcome = Result<SearchResult<Move>, SearchError>;

/// The ALPHA chess engine.
#[derive(Debug)]
pub struct Engine {
    /// The current state of the chess board, as known to the engine.
    ///
    /// This is modified whenever moves are played or new positions are given,
    /// and is reset whenever the engine is told to start a new game.
    board: ChessBoard,

    /// The position new games start from.
    startpos: ChessBoard,

    /// The side the engine plays in interactive games.
    engine: Color,

    /// How pawns in the center are rewarded.
    center: CenterPolicy,

    /// Number of candidates kept after every round.
    width: usize,

    /// Number of search rounds.
    depth: usize,

    /// Whether the engine is playing a game against a human on the terminal.
    ///
    /// This is switched off as soon as a GUI identifies itself with `uci`.
    interactive: bool,

    /// One half of a channel, responsible for sending commands to the engine to execute.
    sender: Sender<EngineCommand>,

    /// One half of a channel, responsible for receiving commands for the engine to execute.
    receiver: Receiver<EngineCommand>,

    /// Atomic flag to determine whether a search is currently running
    is_searching: Arc<AtomicBool>,

    /// Handle to the currently-running search thread, if one exists.
    search_thread: Option<JoinHandle<SearchOutcome>>,
}

impl Engine {
    /// Constructs a new [`Engine`] instance to be executed with [`Engine::run`].
    pub fn new() -> Self {
        // Construct a channel for communication between the input thread and the engine
        let (sender, receiver) = channel();

        Self {
            board: ChessBoard::default(),
            startpos: ChessBoard::default(),
            engine: Color::Black,
            center: CenterPolicy::default(),
            width: DEFAULT_WIDTH,
            depth: DEFAULT_DEPTH,
            interactive: true,
            sender,
            receiver,
            is_searching: Arc::default(),
            search_thread: None,
        }
    }

    /// Constructs a new [`Engine`] from the startup options.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut engine = Self::new();

        if let Some(fen) = &cli.fen {
            engine.startpos = ChessBoard::from_fen(fen)
                .with_context(|| format!("Failed to parse starting position {fen:?}"))?;
            engine.board = engine.startpos.clone();
        }

        engine.engine = cli.engine.into();
        engine.center = cli.center;
        engine.width = cli.width;
        engine.depth = cli.depth;

        // Reject nonsense before any game is played
        SearchConfig::new(engine.width, engine.depth).validate()?;

        Ok(engine)
    }

    /// Returns a string of the engine's name and current version.
    pub fn name(&self) -> String {
        format!("{ENGINE_NAME} {}", env!("CARGO_PKG_VERSION"))
    }

    /// Returns a string of all authors of this engine.
    pub fn authors(&self) -> String {
        // Split multiple authors by comma-space
        env!("CARGO_PKG_AUTHORS").replace(':', ", ").to_string()
    }

    /// Returns the current position.
    pub fn board(&self) -> &ChessBoard {
        &self.board
    }

    /// Sends an [`EngineCommand`] to the engine to be executed.
    pub fn send_command(&self, command: EngineCommand) -> Result<()> {
        self.sender
            .send(command)
            .context("Failed to send command to engine")
    }

    /// Execute the main event loop for the engine.
    ///
    /// This function spawns a thread to handle input from `stdin` and waits on received commands.
    pub fn run(&mut self) -> Result<()> {
        println!("{} is starting...", self.name());
        println!("San moves are accepted.");
        self.display();

        // If the engine has the first move, it makes it right away
        if self.board.side_to_move() == self.engine {
            self.send_command(EngineCommand::Go)?;
        }

        // Spawn a separate thread for handling user input
        let sender = self.sender.clone();
        thread::spawn(|| {
            if let Err(err) = input_handler(sender) {
                log::warn!("Input handler thread stopping: {err}");
            }
        });

        // Loop on user input
        while let Ok(cmd) = self.receiver.recv() {
            let keep_running = match cmd {
                EngineCommand::Bench { depth, pretty } => self.bench(depth, pretty).map(|_| true),

                EngineCommand::Display => {
                    self.display();
                    Ok(true)
                }

                EngineCommand::Eval { pretty } => {
                    self.eval(pretty);
                    Ok(true)
                }

                EngineCommand::Exit { cleanup } => {
                    // If requested, await the completion of any ongoing search threads
                    if cleanup {
                        self.await_search();
                    }

                    // Exit the loop so the engine can quit
                    break;
                }

                EngineCommand::Fen => {
                    println!("{}", self.board.to_fen());
                    Ok(true)
                }

                EngineCommand::Go => self.reply(),

                EngineCommand::Moves => {
                    self.moves();
                    Ok(true)
                }

                EngineCommand::Option { name } => {
                    let name = name.join(" ");
                    if let Some(value) = self.get_option(&name) {
                        println!("{name} := {value}");
                    } else {
                        println!("{} has no option {name:?}", self.name());
                    }
                    Ok(true)
                }

                EngineCommand::Play { mv } => self.play(&mv),

                EngineCommand::Uci { cmd } => self.handle_uci_command(cmd).map(|_| true),

                EngineCommand::Wait => {
                    self.await_search();
                    Ok(true)
                }
            };

            // Keep running, even on error
            match keep_running {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("Error: {e:#}"),
            }
        }

        Ok(())
    }

    /// Handle the execution of a single [`UciCommand`].
    fn handle_uci_command(&mut self, uci: UciCommand) -> Result<()> {
        use UciCommand::*;
        match uci {
            Uci => self.uci(),

            IsReady => println!("{}", UciResponse::<&str>::ReadyOk),

            SetOption { name, value } => self.set_option(&name, value)?,

            UciNewGame => self.new_game(),

            Position { fen, moves } => self.position(fen, moves)?,

            // On the terminal, `go` just asks the engine to move now
            Go(_) if self.interactive => {
                self.reply()?;
            }

            Go(options) => {
                let config = SearchConfig::from_uci(
                    &options,
                    self.width,
                    self.depth,
                    self.board.side_to_move(),
                );
                // Keep the handle of a search that is still running
                if let Some(handle) = self.start_search(config) {
                    self.search_thread = Some(handle);
                }
            }

            Stop => self.set_is_searching(false),

            Quit => self.send_command(EngineCommand::Exit { cleanup: false })?,

            _ => bail!("{} does not support UCI command {uci:?}", self.name()),
        }

        Ok(())
    }

    /// Plays a move entered by the human, then lets the engine reply.
    ///
    /// Returns `false` once the game is over.
    fn play(&mut self, input: &str) -> Result<bool> {
        if let Some(result) = self.board.result() {
            println!("Game over: {result}");
            return Ok(false);
        }

        let Ok(mv) = parse_move(&self.board, input) else {
            log::debug!("Rejected move {input:?} in {}", self.board.to_fen());
            println!("Invalid move");
            return Ok(true);
        };

        self.board.apply(mv);
        self.display();

        if self.announce_result() {
            return Ok(false);
        }

        if self.interactive && self.board.side_to_move() == self.engine {
            return self.reply();
        }

        Ok(true)
    }

    /// Searches the current position and plays the move found.
    ///
    /// Returns `false` once the game is over.
    fn reply(&mut self) -> Result<bool> {
        if self.announce_result() {
            return Ok(false);
        }

        if self.is_searching() {
            bail!("A search is already running");
        }

        let starttime = Instant::now();
        let config = SearchConfig {
            starttime,
            ..SearchConfig::new(self.width, self.depth)
        };

        // The engine always plays for the side to move
        let evaluator = Evaluator::new(self.board.side_to_move(), self.center);

        self.set_is_searching(true);
        let res = Search::new(&evaluator, Arc::clone(&self.is_searching), config)
            .start(&mut self.board);
        self.set_is_searching(false);

        let res = res.context("Search failed")?;
        let Some(mv) = res.bestmove else {
            bail!("Search of {} produced no move", self.board.to_fen());
        };

        log::info!(
            "Searched {} nodes over {} rounds; playing {mv} with score {}",
            res.nodes,
            res.rounds,
            res.score
        );

        println!("{}", computer_plays(mv));
        self.board.apply(mv);
        self.display();
        println!(
            "Computer thought for {:.2} seconds.",
            starttime.elapsed().as_secs_f32()
        );

        Ok(!self.announce_result())
    }

    /// Prints the result of the game if it is over, returning whether it was.
    ///
    /// Only interactive games end this way; a GUI decides for itself when a game is over.
    fn announce_result(&self) -> bool {
        if !self.interactive {
            return false;
        }

        match self.board.result() {
            Some(result) => {
                println!("Game over: {result}");
                true
            }
            None => false,
        }
    }

    /// Execute the `bench` command, running a fixed search on a series of positions and displaying the results.
    fn bench(&mut self, depth: Option<usize>, pretty: bool) -> Result<()> {
        let depth = depth.unwrap_or(BENCH_DEPTH);
        let starttime = Instant::now();

        let benches = BENCHMARK_FENS;
        let num_tests = benches.len();
        let mut nodes = 0;

        // Run a fixed search on each position
        for (i, fen) in benches.into_iter().enumerate() {
            println!("Benchmark position {}/{}: {fen}", i + 1, num_tests);

            let mut board = ChessBoard::from_fen(fen)?;
            let evaluator = Evaluator::new(board.side_to_move(), self.center);
            let config = SearchConfig::new(self.width, depth);

            let res = Search::new(&evaluator, Arc::new(AtomicBool::new(true)), config)
                .start(&mut board)
                .with_context(|| format!("Benchmark search failed on {fen:?}"))?;

            log::debug!(
                "Benchmark position {}: bestmove {:?} score {}",
                i + 1,
                res.bestmove.map(|mv| mv.to_string()),
                res.score
            );
            nodes += res.nodes;
        }

        // Compute results
        let elapsed = starttime.elapsed();
        let nps = (nodes as f32 / elapsed.as_secs_f32()) as u64;
        let m_nps = nodes as f32 / elapsed.as_secs_f32() / 1_000_000.0;
        let ms = elapsed.as_millis();

        if pretty {
            // Display the results in a nice table
            println!();
            println!("+--- Benchmark Complete ---+");
            println!("| time (ms)  : {ms:<12}|");
            println!("| nodes      : {nodes:<12}|");
            println!("| nps        : {nps:<12}|");
            println!("| Mnps       : {m_nps:<12.2}|");
            println!("+--------------------------+");
        } else {
            println!("{nodes} nodes {nps} nps");
        }

        Ok(())
    }

    /// Executes the `display` command, printing the current position.
    fn display(&self) {
        println!("{}", self.board);
    }

    /// Executes the `eval` command, printing an evaluation of the current position.
    fn eval(&self, pretty: bool) {
        let evaluator = Evaluator::new(self.engine, self.center);
        if pretty {
            print!("{}\n\nScore: ", evaluator.pretty(&self.board));
        }

        println!("{}", evaluator.eval(&self.board));
    }

    /// Executes the `moves` command, printing all legal moves in SAN.
    fn moves(&self) {
        let moves = self.board.legal_moves();

        // If there are none, print "(none)"
        let moves_string = if moves.is_empty() {
            String::from("(none)")
        } else {
            // Otherwise, join them by comma-space
            moves
                .into_iter()
                .map(|mv| to_san(&self.board, mv))
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("{moves_string}");
    }

    /// Set the position to the supplied FEN string (defaults to the standard startpos if not supplied),
    /// and then apply `moves` one-by-one to the position.
    fn position<T: AsRef<str>>(
        &mut self,
        fen: Option<T>,
        moves: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        // Set the new position
        self.board = if let Some(fen) = fen {
            ChessBoard::from_fen(fen.as_ref())?
        } else {
            ChessBoard::default()
        };

        // Apply the provided moves
        for mv_str in moves {
            let mv_str = mv_str.as_ref();
            let Some(mv) = self
                .board
                .legal_moves()
                .into_iter()
                .find(|mv| mv.to_string() == mv_str)
            else {
                bail!("{mv_str:?} is not a legal move in {}", self.board.to_fen());
            };
            self.board.apply(mv);
        }

        Ok(())
    }

    /// Resets the engine's internal game state.
    ///
    /// It also cancels any ongoing searches, ignoring their results.
    fn new_game(&mut self) {
        self.set_is_searching(false);
        self.board = self.startpos.clone();
    }

    /// Sets the search flag to signal that the engine is starting/stopping a search.
    fn set_is_searching(&mut self, status: bool) {
        self.is_searching.store(status, Ordering::Relaxed);
    }

    /// Returns `true` if the engine is currently executing a search.
    fn is_searching(&self) -> bool {
        self.is_searching.load(Ordering::Relaxed)
    }

    /// Starts a search on the current position, given the parameters in `config`.
    ///
    /// The search thread reports its progress and `bestmove` over UCI.
    fn start_search(&mut self, config: SearchConfig) -> Option<JoinHandle<SearchOutcome>> {
        // Cannot start a search if one is already running
        if self.is_searching() {
            eprintln!("A search is already running");
            return None;
        }
        self.set_is_searching(true);

        // Clone the parameters that will be sent into the thread
        let mut board = self.board.clone();
        let evaluator = Evaluator::new(board.side_to_move(), self.center);
        let is_searching = Arc::clone(&self.is_searching);

        // Spawn a thread to conduct the search
        let handle = thread::spawn(move || {
            send_info(UciInfo::new().string(format!(
                "Starting search on {:?} with width {} over {} rounds",
                board.to_fen(),
                config.width,
                config.depth
            )));

            let res = Search::new(&evaluator, Arc::clone(&is_searching), config).start(&mut board);

            let bestmove = match &res {
                Ok(res) => {
                    let elapsed = config.starttime.elapsed();
                    log::info!(
                        "Searched {} nodes over {} rounds in {}ms",
                        res.nodes,
                        res.rounds,
                        elapsed.as_millis()
                    );
                    send_info(
                        UciInfo::new()
                            .depth(res.rounds)
                            .nodes(res.nodes)
                            .nps((res.nodes as f32 / elapsed.as_secs_f32()).trunc())
                            .time(elapsed.as_millis()),
                    );
                    send_info(UciInfo::new().string(format!("score {}", res.score)));
                    res.bestmove
                }
                Err(err) => {
                    send_info(UciInfo::new().string(format!("{err}")));
                    None
                }
            };

            // Search has ended; send bestmove
            let response = UciResponse::BestMove {
                bestmove,
                ponder: None,
            };
            println!("{response}");

            // Search has concluded, alert other threads that we are no longer searching
            is_searching.store(false, Ordering::Relaxed);

            res
        });

        Some(handle)
    }

    /// Awaits the current search thread, blocking until it finishes and returning its result.
    fn await_search(&mut self) -> Option<SearchOutcome> {
        // Can't await a search if there aren't any threads searching!
        let handle = self.search_thread.take()?;

        // Attempt to join the thread handle to retrieve the result
        let id = handle.thread().id();
        let Ok(res) = handle.join() else {
            eprintln!("Failed to join on thread {id:?}");
            return None;
        };

        self.set_is_searching(false);

        Some(res)
    }

    /// Called when the engine receives the `uci` command.
    ///
    /// Prints engine's ID, version, and authors, and lists all UCI options.
    fn uci(&mut self) {
        // A GUI is in charge from now on
        self.interactive = false;

        println!("id name {}\nid author {}\n", self.name(), self.authors());

        // Print all UCI options
        for opt in self.options() {
            println!("{}", UciResponse::Option(opt));
        }

        // We're ready to go!
        println!("{}", UciResponse::<&str>::UciOk)
    }

    /// Convenience function to return an iterator over all UCI options this engine supports.
    fn options(&self) -> impl Iterator<Item = UciOption<&str>> {
        [
            UciOption::spin("Width", DEFAULT_WIDTH as i32, 1, MAX_SPIN as i32),
            UciOption::spin("Depth", DEFAULT_DEPTH as i32, 1, MAX_SPIN as i32),
        ]
        .into_iter()
    }

    /// Handles the `setoption` command, setting option `name` to `value`.
    ///
    /// Will return an error if `name` isn't a valid option or `value` is not a valid value for that option.
    fn set_option(&mut self, name: &str, value: Option<String>) -> Result<()> {
        let Some(value) = value else {
            bail!("Option {name:?} requires a value");
        };

        let parsed = value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid value {value:?} for option {name:?}"))?;

        if !(1..=MAX_SPIN).contains(&parsed) {
            bail!("Option {name:?} must be between 1 and {MAX_SPIN}, got {parsed}");
        }

        match name {
            "Width" => self.width = parsed,
            "Depth" => self.depth = parsed,
            _ => bail!("{} has no option named {name:?}", self.name()),
        }

        log::info!("Option {name} has been set to {parsed}");

        Ok(())
    }

    /// Returns the current value of the option `name`, if it exists on this engine.
    fn get_option(&self, name: &str) -> Option<String> {
        let value = match name {
            "Width" => self.width.to_string(),
            "Depth" => self.depth.to_string(),
            "Engine" => self.engine.name().to_string(),
            "Center" => self.center.to_string(),
            _ => return None,
        };

        Some(value)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Announces the engine's move in an interactive game, in UCI notation.
fn computer_plays(mv: Move) -> String {
    format!("Computer plays: {mv}")
}

#[inline(always)]
fn send_info(info: UciInfo) {
    let resp = UciResponse::<String>::Info(Box::new(info));
    println!("{resp}");
}

/// Loops endlessly to await input via `stdin`, sending all successfully-parsed commands through the supplied `sender`.
fn input_handler(sender: Sender<EngineCommand>) -> Result<()> {
    let mut buffer = String::with_capacity(2048);

    loop {
        // Clear the buffer, read input, and trim the trailing newline
        buffer.clear();
        let bytes = io::stdin()
            .read_line(&mut buffer)
            .context("Failed to read line from stdin")?;

        // For ctrl + d
        if 0 == bytes {
            // Send the Quit command and exit this function
            sender
                .send(EngineCommand::Exit { cleanup: false })
                .context("Failed to send 'quit' command after receiving empty input")?;

            bail!("Engine received input of 0 bytes and is quitting");
        }

        // Trim any leading/trailing whitespace
        let buf = buffer.trim();

        // Ignore empty lines
        if buf.is_empty() {
            continue;
        }

        sender
            .send(classify(buf))
            .context("Failed to send command to engine")?;
    }
}

/// Decides what a line of input is: a UCI command, an engine command, or a move.
fn classify(buf: &str) -> EngineCommand {
    use clap::Parser;

    // Attempt to parse the input as a UCI command first, since GUIs expect that
    match UciCommand::new(buf) {
        Ok(cmd) => EngineCommand::Uci { cmd },

        // If it's not a UCI command, check if it's an engine-specific command
        Err(UciParseError::UnrecognizedCommand { cmd: _ }) => {
            match EngineCommand::try_parse_from(buf.split_ascii_whitespace()) {
                Ok(cmd) => cmd,

                // Anything else is treated as a move, and rejected if illegal
                Err(_) => EngineCommand::Play {
                    mv: buf.to_string(),
                },
            }
        }

        // A malformed UCI command still goes to the engine as a move, which will be rejected
        Err(uci_err) => {
            log::debug!("{buf:?} is not a valid UCI command: {uci_err}");
            EngineCommand::Play {
                mv: buf.to_string(),
            }
        }
    }
}
