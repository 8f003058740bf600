//! Scriptable success/failure conditions for test doubles.

use std::fmt;
use std::sync::Mutex;

/// Decides, call by call, whether an operation should succeed.
pub trait Condition: fmt::Display + Send + Sync {
    fn ok(&self) -> bool;
}

/// Always succeeds (`Work(true)`) or always fails (`Work(false)`).
#[derive(Debug, Clone, Copy)]
pub struct Work(pub bool);

impl Condition for Work {
    fn ok(&self) -> bool {
        self.0
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 {
            write!(f, "Always Working.")
        } else {
            write!(f, "Never Working.")
        }
    }
}

/// Fails the first `n` times, then works forever.
#[derive(Debug)]
pub struct Fail2Work {
    left: Mutex<u32>,
}

impl Fail2Work {
    pub fn new(n: u32) -> Self {
        Self { left: Mutex::new(n) }
    }
}

impl Condition for Fail2Work {
    fn ok(&self) -> bool {
        let mut left = self.left.lock().unwrap_or_else(|e| e.into_inner());
        if *left > 0 {
            *left -= 1;
            false
        } else {
            true
        }
    }
}

impl fmt::Display for Fail2Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let left = *self.left.lock().unwrap_or_else(|e| e.into_inner());
        if left > 0 {
            write!(f, "Still Broken, {} to go.", left)
        } else {
            write!(f, "Working.")
        }
    }
}

struct Link {
    remaining: u32,
    unbounded: bool,
    cond: Box<dyn Condition>,
}

/// Runs through a list of conditions, each good for a number of calls.
///
/// Each condition answers `count` calls before the next one takes over; a
/// count of zero means "from here on". Once the chain is exhausted the last
/// condition keeps answering.
pub struct Chain {
    links: Mutex<Vec<Link>>,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
        }
    }

    /// Append a condition answering the next `count` calls.
    pub fn then(mut self, count: u32, cond: impl Condition + 'static) -> Self {
        self.links
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(Link {
                remaining: count,
                unbounded: count == 0,
                cond: Box::new(cond),
            });
        self
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition for Chain {
    fn ok(&self) -> bool {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        while links.len() > 1 && !links[0].unbounded && links[0].remaining == 0 {
            links.remove(0);
        }
        let Some(link) = links.first_mut() else {
            return true;
        };
        if !link.unbounded && link.remaining > 0 {
            link.remaining -= 1;
        }
        link.cond.ok()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        write!(f, "Chain(")?;
        for (i, link) in links.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} × {}", link.remaining, link.cond)?;
        }
        write!(f, ")")
    }
}
