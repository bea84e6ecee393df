//! Scoped thread-context editing.
//!
//! Suspend, fetch, mutate, write back, resume. The guard releases the thread
//! on every path: `commit` writes the context back, and drop (including an
//! unwind) still resumes and closes the handle.

use crate::error::Result;
use crate::os::{Platform, RawHandle, ThreadContext, Tid};
use std::sync::Arc;

pub struct ContextEdit {
    platform: Arc<dyn Platform>,
    handle: RawHandle,
    tid: Tid,
    wow64: bool,
    pub context: ThreadContext,
}

impl ContextEdit {
    /// Opens and suspends `tid` and fetches its full context, debug
    /// registers included. Any failure releases whatever was acquired.
    pub fn begin(platform: Arc<dyn Platform>, tid: Tid, wow64: bool) -> Result<Self> {
        let handle = platform.open_thread(tid)?;
        if let Err(err) = platform.suspend_thread(handle) {
            platform.close_handle(handle);
            return Err(err);
        }
        let context = match platform.thread_context(handle, wow64) {
            Ok(context) => context,
            Err(err) => {
                let _ = platform.resume_thread(handle);
                platform.close_handle(handle);
                return Err(err);
            }
        };
        Ok(Self {
            platform,
            handle,
            tid,
            wow64,
            context,
        })
    }

    pub fn thread_id(&self) -> Tid {
        self.tid
    }

    /// Writes the (possibly mutated) context back. Resume and close happen
    /// in drop either way.
    pub fn commit(self) -> Result<()> {
        self.platform
            .set_thread_context(self.handle, &self.context, self.wow64)
    }
}

impl Drop for ContextEdit {
    fn drop(&mut self) {
        if let Err(err) = self.platform.resume_thread(self.handle) {
            log::warn!("Failed to resume thread {}: {err}", self.tid);
        }
        self.platform.close_handle(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sim::SimPlatform;
    use crate::os::ThreadContext;

    #[test]
    fn test_commit_writes_back_and_resumes() {
        let sim = Arc::new(SimPlatform::new());
        sim.add_thread(7, ThreadContext::default());

        let mut edit = ContextEdit::begin(sim.clone(), 7, false).unwrap();
        assert_eq!(sim.suspend_count(7), 1);
        edit.context.ip = 0xDEAD;
        edit.commit().unwrap();

        assert_eq!(sim.suspend_count(7), 0);
        assert_eq!(sim.context_of(7).ip, 0xDEAD);
    }

    #[test]
    fn test_drop_without_commit_still_releases() {
        let sim = Arc::new(SimPlatform::new());
        sim.add_thread(7, ThreadContext::default());

        {
            let mut edit = ContextEdit::begin(sim.clone(), 7, false).unwrap();
            edit.context.ip = 0xDEAD;
            // No commit.
        }
        assert_eq!(sim.suspend_count(7), 0);
        assert_eq!(sim.context_of(7).ip, 0);
    }

    #[test]
    fn test_release_on_unwind() {
        let sim = Arc::new(SimPlatform::new());
        sim.add_thread(7, ThreadContext::default());

        let sim2 = sim.clone();
        let result = std::panic::catch_unwind(move || {
            let _edit = ContextEdit::begin(sim2, 7, false).unwrap();
            panic!("client panics while editing");
        });
        assert!(result.is_err());
        assert_eq!(sim.suspend_count(7), 0);
    }

    #[test]
    fn test_begin_unknown_thread_fails() {
        let sim = Arc::new(SimPlatform::new());
        assert!(ContextEdit::begin(sim, 99, false).is_err());
    }
}
