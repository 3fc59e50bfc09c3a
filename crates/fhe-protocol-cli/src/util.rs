//! Console helpers.

use std::io::{self, BufRead, Write};

use console::style;
use fhe_protocol::votes::{Roster, VoteEvent, VoteSource};
use fhe_protocol::Error;

/// Evaluates an expression and prints how long it took.
macro_rules! timeit {
    ($name:expr, $code:expr) => {{
        let start = std::time::Instant::now();
        let result = $code;
        println!(
            "{} {} in {:?}",
            console::style("    ⏱").magenta(),
            $name,
            start.elapsed()
        );
        result
    }};
}

pub(crate) use timeit;

/// Prompts for votes on standard input until `voters` valid votes were cast.
pub struct PromptVoteSource<'a, R> {
    input: R,
    roster: &'a Roster,
    remaining: usize,
}

impl<'a> PromptVoteSource<'a, io::StdinLock<'static>> {
    pub fn stdin(roster: &'a Roster, voters: usize) -> Self {
        Self::new(io::stdin().lock(), roster, voters)
    }
}

impl<'a, R: BufRead> PromptVoteSource<'a, R> {
    pub fn new(input: R, roster: &'a Roster, voters: usize) -> Self {
        Self {
            input,
            roster,
            remaining: voters,
        }
    }

    fn prompt(&self) {
        println!("{}", style("Vote for:").bold());
        for (i, name) in self.roster.names().iter().enumerate() {
            println!("  {}. {name}", i + 1);
        }
        print!("Enter your vote (1-{}): ", self.roster.len());
        let _ = io::stdout().flush();
    }
}

impl<R: BufRead> VoteSource for PromptVoteSource<'_, R> {
    fn next_vote(&mut self) -> Option<VoteEvent> {
        while self.remaining > 0 {
            self.prompt();
            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            match line.trim().parse::<i64>() {
                Ok(choice) => {
                    self.remaining -= 1;
                    return Some(VoteEvent { choice });
                }
                Err(_) => println!("{} not a number", style("error:").red().bold()),
            }
        }
        None
    }

    fn rejected(&mut self, _event: &VoteEvent, error: &Error) {
        println!("{} {error}", style("error:").red().bold());
        self.remaining += 1;
    }
}
