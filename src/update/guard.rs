use std::sync::{Arc, Mutex, PoisonError};

/// Single-flight flag shared by every entry point that can start an update cycle.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<Mutex<bool>>,
}

/// Held for the duration of one cycle. Dropping it releases the guard.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<Mutex<bool>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `None` when another cycle already holds the guard.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *running {
            return None;
        }
        *running = true;
        Some(RunPermit {
            running: self.running.clone(),
        })
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_permit_dropped() {
        let guard = RunGuard::new();
        assert!(!guard.is_running());

        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let guard = RunGuard::new();
        let other = guard.clone();

        let _permit = guard.try_acquire().expect("acquire");
        assert!(other.is_running());
        assert!(other.try_acquire().is_none());
    }

    #[test]
    fn permit_released_when_holder_thread_panics() {
        let guard = RunGuard::new();
        let worker = guard.clone();
        let joined = std::thread::spawn(move || {
            let _permit = worker.try_acquire().expect("acquire");
            panic!("cycle blew up");
        })
        .join();

        assert!(joined.is_err());
        assert!(!guard.is_running());
    }
}
