/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chessie::Color;
use uci_parser::UciSearchOptions;

use crate::{Evaluate, RulesProvider, SearchError};

/// Default number of candidates kept after every round.
pub const DEFAULT_WIDTH: usize = 30;

/// Default number of narrowing rounds.
pub const DEFAULT_DEPTH: usize = 5;

/// A scored move awaiting further narrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate<M> {
    /// Evaluation of this move, from the engine's perspective.
    pub score: i32,

    /// The root move being scored.
    pub mv: M,
}

impl<M: fmt::Display> fmt::Display for Candidate<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.mv, self.score)
    }
}

/// The result of a search, containing the best move found, its score, and the final candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult<M> {
    /// Number of positions evaluated.
    pub nodes: u64,

    /// Best move found during the search.
    pub bestmove: Option<M>,

    /// Score of `bestmove` after the last completed round.
    pub score: i32,

    /// Number of rounds that ran to completion.
    pub rounds: usize,

    /// Candidates that survived the last completed round, best first.
    pub candidates: Vec<Candidate<M>>,
}

impl<M: Copy> SearchResult<M> {
    /// Builds a result from a sorted candidate list.
    fn new(candidates: Vec<Candidate<M>>, nodes: u64, rounds: usize) -> Self {
        let best = candidates.first().copied();

        Self {
            nodes,
            bestmove: best.map(|c| c.mv),
            score: best.map(|c| c.score).unwrap_or(i32::MIN),
            rounds,
            candidates,
        }
    }
}

/// Configuration variables for executing a [`Search`].
#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    /// Number of candidates kept after every round.
    pub width: usize,

    /// Number of rounds: one to score every root move, then `depth - 1` reply-minimization rounds.
    pub depth: usize,

    /// Node allowance.
    ///
    /// If the search exceeds this many evaluations, it will exit as quickly as possible.
    pub max_nodes: u64,

    /// Start time of the search.
    pub starttime: Instant,

    /// Hard limit on search time.
    ///
    /// During *any* point in the search, if this limit is exceeded, the search will cancel.
    pub hard_timeout: Duration,
}

impl SearchConfig {
    /// A search of `width` candidates over `depth` rounds, without any time or node limits.
    #[inline(always)]
    pub fn new(width: usize, depth: usize) -> Self {
        Self {
            width,
            depth,
            ..Default::default()
        }
    }

    /// Constructs a new [`SearchConfig`] from the provided UCI options.
    ///
    /// `side` is the side to move, and is used to pick the relevant clock when computing the timeout.
    pub fn from_uci(options: &UciSearchOptions, width: usize, depth: usize, side: Color) -> Self {
        let mut config = Self::new(width, depth);

        // A requested depth is the number of rounds to run
        if let Some(depth) = options.depth {
            config.depth = depth as usize;
        }

        if let Some(nodes) = options.nodes {
            config.max_nodes = nodes as u64;
        }

        // If `movetime` was supplied, search that long.
        if let Some(movetime) = options.movetime {
            config.hard_timeout = movetime;
        } else {
            // Otherwise, search based on time remaining and increment
            let (time, inc) = if side.is_white() {
                (options.wtime, options.winc)
            } else {
                (options.btime, options.binc)
            };

            if let Some(time) = time {
                let inc = inc.unwrap_or(Duration::ZERO);
                config.hard_timeout = time / 5 + inc / 2; // 20% of time remaining + 50% time increment
            }
        }

        config
    }

    /// Rejects configurations under which the search is meaningless.
    #[inline(always)]
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.width == 0 || self.depth == 0 {
            return Err(SearchError::InvalidConfiguration {
                width: self.width,
                depth: self.depth,
            });
        }

        Ok(())
    }
}

impl Default for SearchConfig {
    /// A default [`SearchConfig`] uses the default width and depth, and never times out.
    #[inline(always)]
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            depth: DEFAULT_DEPTH,
            max_nodes: u64::MAX,
            starttime: Instant::now(),
            hard_timeout: Duration::MAX,
        }
    }
}

/// The state a search started from, which every guarded block must return to.
struct Root<S> {
    ply: usize,
    snapshot: S,
}

/// Executes a beam-narrowing search.
///
/// Every legal root move is scored, and the best `width` of them become candidates.
/// Each following round replaces a candidate's score with the lowest score among the
/// opponent's replies to it, then re-sorts and truncates the list again.
///
/// Replies are scored by the same evaluator and minimized, rather than scored from the
/// opponent's side and maximized. This is not minimax: only a single reply is ever looked at
/// below each candidate.
pub struct Search<'a, E> {
    /// Scores positions from the engine's perspective.
    evaluator: &'a E,

    /// An atomic flag to determine if the search should be cancelled at any time.
    ///
    /// If this is ever `false`, the search will exit as soon as possible.
    is_searching: Arc<AtomicBool>,

    /// Configuration variables for this instance of the search.
    config: SearchConfig,

    /// Number of positions evaluated so far.
    nodes: u64,
}

impl<'a, E> Search<'a, E> {
    /// Construct a new [`Search`] instance that scores positions with `evaluator`.
    #[inline(always)]
    pub fn new(evaluator: &'a E, is_searching: Arc<AtomicBool>, config: SearchConfig) -> Self {
        Self {
            evaluator,
            is_searching,
            config,
            nodes: 0,
        }
    }

    /// Start the search on `position`, returning its results if the search was successful.
    ///
    /// If the search is cancelled partway through a round, that round is discarded
    /// and the result of the last completed round is returned instead.
    /// If not even the first round completed, this fails with [`SearchError::Aborted`].
    ///
    /// `position` is always left exactly as it was given.
    pub fn start<P>(mut self, position: &mut P) -> Result<SearchResult<P::Move>, SearchError>
    where
        P: RulesProvider,
        E: Evaluate<P>,
    {
        self.config.validate()?;

        let root = Root {
            ply: position.ply(),
            snapshot: position.snapshot(),
        };
        let moves = position.legal_moves();
        if moves.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        // Round 1: score every root move
        let mut candidates = Vec::with_capacity(moves.len());
        for mv in moves {
            let score = self.score_after(position, mv)?;
            candidates.push(Candidate { score, mv });
        }
        self.verify_root(position, &root)?;
        self.narrow(&mut candidates);

        let mut rounds = 1;
        self.log_round(rounds, &candidates);

        while rounds < self.config.depth {
            match self.minimize_replies(position, &candidates, &root) {
                Ok(next) => {
                    candidates = next;
                    rounds += 1;
                    self.log_round(rounds, &candidates);
                }

                Err(SearchError::Aborted(reason)) => {
                    log::info!(
                        "Search cancelled during round {}: {reason}. Falling back to round {rounds}",
                        rounds + 1
                    );
                    break;
                }

                Err(err) => return Err(err),
            }
        }

        Ok(SearchResult::new(candidates, self.nodes, rounds))
    }

    /// Runs one reply-minimization round over `candidates`, returning the re-scored, re-sorted list.
    fn minimize_replies<P>(
        &mut self,
        position: &mut P,
        candidates: &[Candidate<P::Move>],
        root: &Root<P::Snapshot>,
    ) -> Result<Vec<Candidate<P::Move>>, SearchError>
    where
        P: RulesProvider,
        E: Evaluate<P>,
    {
        let mut next = Vec::with_capacity(candidates.len());

        for &Candidate { score, mv } in candidates {
            let new_score = {
                let mut played = position.play(mv);

                // Assume the opponent picks the reply that is worst for us
                let mut worst = None;
                for reply in played.legal_moves() {
                    let reply_score = self.score_after(&mut *played, reply)?;
                    worst = Some(worst.map_or(reply_score, |w: i32| w.min(reply_score)));
                }

                // A candidate that ends the game keeps its score
                worst.unwrap_or(score)
            };

            self.verify_root(position, root)?;
            next.push(Candidate {
                score: new_score,
                mv,
            });
        }

        self.narrow(&mut next);
        Ok(next)
    }

    /// Plays `mv`, evaluates the resulting position, and takes `mv` back.
    #[inline(always)]
    fn score_after<P>(&mut self, position: &mut P, mv: P::Move) -> Result<i32, SearchError>
    where
        P: RulesProvider,
        E: Evaluate<P>,
    {
        self.check_limits()?;
        self.nodes += 1;

        let played = position.play(mv);
        let score = self.evaluator.evaluate(&*played);

        Ok(score)
    }

    /// Sorts candidates best-first, keeping enumeration order between equal scores, and keeps the best `width`.
    #[inline(always)]
    fn narrow<M>(&self, candidates: &mut Vec<Candidate<M>>) {
        // `sort_by` is stable
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates.truncate(self.config.width);
    }

    /// Fails if we've run out of time or nodes, or were told to stop.
    #[inline(always)]
    fn check_limits(&self) -> Result<(), SearchError> {
        // Condition 1: We've exceeded the hard limit of our allotted search time
        if self.config.starttime.elapsed() >= self.config.hard_timeout {
            let ms = self.config.hard_timeout.as_millis();
            return Err(SearchError::Aborted(format!(
                "exceeded hard timeout of {ms}ms"
            )));
        }

        // Condition 2: The search was stopped by an external factor, like the `stop` command
        if !self.is_searching.load(Ordering::Relaxed) {
            return Err(SearchError::Aborted(String::from(
                "cancelled by external command",
            )));
        }

        // Condition 3: We've exceeded the maximum amount of nodes we're allowed to search
        if self.nodes >= self.config.max_nodes {
            let nodes = self.config.max_nodes;
            return Err(SearchError::Aborted(format!(
                "exceeded node allowance of {nodes} nodes"
            )));
        }

        Ok(())
    }

    /// Fails if `position` has not returned to the root after a guarded block.
    #[inline(always)]
    fn verify_root<P: RulesProvider>(
        &self,
        position: &P,
        root: &Root<P::Snapshot>,
    ) -> Result<(), SearchError> {
        let ply = position.ply();
        if ply != root.ply {
            return Err(SearchError::RulesProviderInconsistency(format!(
                "expected position at ply {} after taking back moves, found ply {ply}",
                root.ply
            )));
        }

        let snapshot = position.snapshot();
        if snapshot != root.snapshot {
            return Err(SearchError::RulesProviderInconsistency(format!(
                "taking back moves restored {snapshot:?} instead of {:?}",
                root.snapshot
            )));
        }

        Ok(())
    }

    fn log_round<M: fmt::Display>(&self, round: usize, candidates: &[Candidate<M>]) {
        log::debug!(
            "Round {round}/{} ({} nodes): {}",
            self.config.depth,
            self.nodes,
            candidates
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

/// Selects a move for the engine in `position`.
///
/// Runs a [`Search`] of `width` candidates over `depth` rounds, without any time limit.
pub fn find_best_move<P, E>(
    position: &mut P,
    evaluator: &E,
    width: usize,
    depth: usize,
) -> Result<P::Move, SearchError>
where
    P: RulesProvider,
    E: Evaluate<P>,
{
    let is_searching = Arc::new(AtomicBool::new(true));
    let res = Search::new(evaluator, is_searching, SearchConfig::new(width, depth)).start(position)?;

    res.bestmove.ok_or(SearchError::NoLegalMoves)
}

#[cfg(test)]
mod tests {
    use chessie::{Bitboard, Piece, Square};

    use super::*;

    /// A game tree with scripted scores, standing in for a real chess position.
    ///
    /// Moves are indices of child nodes; the root is node 0.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Tree {
        nodes: Vec<(i32, Vec<usize>)>,
        path: Vec<usize>,

        /// If set, every undo also leaves a mark behind, so the tree never returns to its prior state.
        leaky: bool,
        marks: usize,
    }

    impl Tree {
        fn new(nodes: Vec<(i32, Vec<usize>)>) -> Self {
            Self {
                nodes,
                path: Vec::new(),
                leaky: false,
                marks: 0,
            }
        }

        fn current(&self) -> usize {
            self.path.last().copied().unwrap_or(0)
        }
    }

    impl RulesProvider for Tree {
        type Move = usize;
        type Snapshot = (Vec<usize>, usize);

        fn legal_moves(&self) -> Vec<usize> {
            self.nodes[self.current()].1.clone()
        }

        fn apply(&mut self, mv: usize) {
            self.path.push(mv);
        }

        fn undo(&mut self) -> Result<(), SearchError> {
            if self.leaky {
                self.marks += 1;
            }

            self.path
                .pop()
                .map(|_| ())
                .ok_or_else(|| SearchError::RulesProviderInconsistency(String::from("empty path")))
        }

        fn ply(&self) -> usize {
            self.path.len()
        }

        fn piece_at(&self, _square: Square) -> Option<Piece> {
            None
        }

        fn attackers(&self, _color: Color, _square: Square) -> Bitboard {
            Bitboard::default()
        }

        fn side_to_move(&self) -> Color {
            if self.path.len() % 2 == 0 {
                Color::White
            } else {
                Color::Black
            }
        }

        fn move_number(&self) -> usize {
            1 + self.path.len() / 2
        }

        fn is_checkmate(&self) -> bool {
            false
        }

        fn is_game_over(&self) -> bool {
            self.legal_moves().is_empty()
        }

        fn snapshot(&self) -> (Vec<usize>, usize) {
            (self.path.clone(), self.marks)
        }
    }

    /// Reads the scripted score of the current node.
    struct Scripted;

    impl Evaluate<Tree> for Scripted {
        fn evaluate(&self, position: &Tree) -> i32 {
            position.nodes[position.current()].0
        }
    }

    fn search(tree: &mut Tree, width: usize, depth: usize) -> Result<SearchResult<usize>, SearchError> {
        Search::new(&Scripted, Arc::new(AtomicBool::new(true)), SearchConfig::new(width, depth))
            .start(tree)
    }

    /// Root with two moves: 1 looks better immediately, but 2 holds up against every reply.
    fn trap() -> Tree {
        Tree::new(vec![
            (0, vec![1, 2]),
            (10, vec![3, 4]),
            (0, vec![5, 6]),
            (5, vec![]),
            (-3, vec![]),
            (2, vec![]),
            (4, vec![]),
        ])
    }

    #[test]
    fn test_single_round_picks_highest_score() {
        let res = search(&mut trap(), 30, 1).unwrap();
        assert_eq!(res.bestmove, Some(1));
        assert_eq!(res.score, 10);
        assert_eq!(res.rounds, 1);
        assert_eq!(res.nodes, 2);
    }

    #[test]
    fn test_replies_are_minimized() {
        let res = search(&mut trap(), 30, 2).unwrap();
        assert_eq!(res.bestmove, Some(2));
        assert_eq!(
            res.candidates,
            vec![Candidate { score: 2, mv: 2 }, Candidate { score: -3, mv: 1 }]
        );
        assert_eq!(res.nodes, 6);
    }

    #[test]
    fn test_later_rounds_look_one_reply_deep_again() {
        // Every round re-scores from the root candidates, so further rounds change nothing here
        let res = search(&mut trap(), 30, 5).unwrap();
        assert_eq!(res.bestmove, Some(2));
        assert_eq!(res.score, 2);
        assert_eq!(res.rounds, 5);
    }

    #[test]
    fn test_terminal_candidate_keeps_its_score() {
        let mut tree = Tree::new(vec![
            (0, vec![1, 2]),
            (7, vec![]),
            (9, vec![3]),
            (1, vec![]),
        ]);

        let res = search(&mut tree, 30, 2).unwrap();
        assert_eq!(res.bestmove, Some(1));
        assert_eq!(res.score, 7);
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let mut tree = Tree::new(vec![
            (0, vec![3, 1, 2]),
            (5, vec![]),
            (5, vec![]),
            (5, vec![]),
        ]);

        let res = search(&mut tree, 30, 3).unwrap();
        let order = res.candidates.iter().map(|c| c.mv).collect::<Vec<_>>();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(res.bestmove, Some(3));
    }

    #[test]
    fn test_beam_never_grows() {
        let mut nodes = vec![(0, (1..=6).collect::<Vec<_>>())];
        for i in 1..=6 {
            nodes.push((i * 10, vec![]));
        }
        let tree = Tree::new(nodes);

        for depth in 1..=4 {
            let res = search(&mut tree.clone(), 3, depth).unwrap();
            assert_eq!(res.candidates.len(), 3);
            assert_eq!(res.rounds, depth);
            assert_eq!(res.bestmove, Some(6));
        }

        let res = search(&mut tree.clone(), 10, 2).unwrap();
        assert_eq!(res.candidates.len(), 6);
    }

    #[test]
    fn test_position_is_restored() {
        let mut tree = trap();
        let original = tree.clone();
        search(&mut tree, 30, 4).unwrap();
        assert_eq!(tree, original);
    }

    #[test]
    fn test_undo_to_wrong_state_is_inconsistent() {
        // Ply counts line up, but the state after taking back differs
        let mut tree = trap();
        tree.leaky = true;

        assert!(matches!(
            search(&mut tree, 30, 1),
            Err(SearchError::RulesProviderInconsistency(_))
        ));
        assert_eq!(tree.ply(), 0);
    }

    #[test]
    fn test_invalid_configuration() {
        let mut tree = trap();
        assert_eq!(
            search(&mut tree, 0, 3),
            Err(SearchError::InvalidConfiguration { width: 0, depth: 3 })
        );
        assert_eq!(
            search(&mut tree, 5, 0),
            Err(SearchError::InvalidConfiguration { width: 5, depth: 0 })
        );
        assert_eq!(
            find_best_move(&mut tree, &Scripted, 0, 0)
                .unwrap_err()
                .to_string(),
            "invalid search configuration: width 0 and depth 0 must both be positive"
        );
    }

    #[test]
    fn test_no_legal_moves() {
        let mut tree = Tree::new(vec![(0, vec![])]);
        assert_eq!(search(&mut tree, 30, 5), Err(SearchError::NoLegalMoves));
        assert_eq!(find_best_move(&mut tree, &Scripted, 30, 5), Err(SearchError::NoLegalMoves));
    }

    #[test]
    fn test_single_legal_move_runs_every_round() {
        let mut tree = Tree::new(vec![(0, vec![1]), (3, vec![2]), (-1, vec![])]);
        let res = search(&mut tree, 30, 4).unwrap();
        assert_eq!(res.bestmove, Some(1));
        assert_eq!(res.rounds, 4);
        assert_eq!(res.nodes, 4);
    }

    #[test]
    fn test_node_allowance_falls_back_to_last_round() {
        let config = SearchConfig {
            max_nodes: 4,
            ..SearchConfig::new(30, 3)
        };
        let mut tree = trap();
        let res = Search::new(&Scripted, Arc::new(AtomicBool::new(true)), config)
            .start(&mut tree)
            .unwrap();

        // Round 2 needs 4 more evaluations, so only round 1 completes
        assert_eq!(res.rounds, 1);
        assert_eq!(res.bestmove, Some(1));
        assert_eq!(tree, trap());
    }

    #[test]
    fn test_abort_before_first_round_fails() {
        let config = SearchConfig {
            max_nodes: 1,
            ..SearchConfig::new(30, 3)
        };
        let mut tree = trap();
        let res = Search::new(&Scripted, Arc::new(AtomicBool::new(true)), config).start(&mut tree);
        assert!(matches!(res, Err(SearchError::Aborted(_))));
        assert_eq!(tree, trap());

        let stopped = Arc::new(AtomicBool::new(false));
        let res = Search::new(&Scripted, stopped, SearchConfig::new(30, 3)).start(&mut tree);
        assert!(matches!(res, Err(SearchError::Aborted(_))));
    }

    #[test]
    fn test_find_best_move() {
        assert_eq!(find_best_move(&mut trap(), &Scripted, 30, 1), Ok(1));
        assert_eq!(find_best_move(&mut trap(), &Scripted, 30, 2), Ok(2));
        assert_eq!(find_best_move(&mut trap(), &Scripted, 1, 2), Ok(1));
    }
}
