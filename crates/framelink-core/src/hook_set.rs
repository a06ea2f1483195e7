//! Install/remove capability shared by the hook components

use crate::present_hook::PresentationHook;
use framelink_common::Result;

/// A group of hooks that is installed and removed as a unit
pub trait HookSet: Send {
    fn name(&self) -> &'static str;

    fn install_hooks(&mut self) -> Result<()>;

    fn remove_hooks(&mut self) -> Result<()>;

    fn is_installed(&self) -> bool;
}

impl HookSet for PresentationHook {
    fn name(&self) -> &'static str {
        "present"
    }

    /// Eager discovery through a throwaway swap chain
    fn install_hooks(&mut self) -> Result<()> {
        self.discover()
    }

    fn remove_hooks(&mut self) -> Result<()> {
        self.remove()
    }

    fn is_installed(&self) -> bool {
        PresentationHook::is_installed(self)
    }
}

/// Remove every set in reverse install order, returning the failures
pub fn remove_all(sets: &mut [&mut dyn HookSet]) -> Vec<(&'static str, framelink_common::Error)> {
    let mut failures = Vec::new();
    for set in sets.iter_mut().rev() {
        if !set.is_installed() {
            continue;
        }
        if let Err(e) = set.remove_hooks() {
            tracing::warn!(
                target: "framelink_core::hooks",
                set = set.name(),
                error = %e,
                "Hook set not removed"
            );
            failures.push((set.name(), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_common::Error;

    struct Counting {
        installed: bool,
        fail_remove: bool,
        removed: u32,
    }

    impl HookSet for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn install_hooks(&mut self) -> Result<()> {
            self.installed = true;
            Ok(())
        }

        fn remove_hooks(&mut self) -> Result<()> {
            self.removed += 1;
            if self.fail_remove {
                return Err(Error::Internal("stuck".into()));
            }
            self.installed = false;
            Ok(())
        }

        fn is_installed(&self) -> bool {
            self.installed
        }
    }

    #[test]
    fn test_remove_all_skips_uninstalled() {
        let mut a = Counting {
            installed: false,
            fail_remove: false,
            removed: 0,
        };
        let mut b = Counting {
            installed: false,
            fail_remove: true,
            removed: 0,
        };
        b.install_hooks().unwrap();

        let failures = remove_all(&mut [&mut a, &mut b]);
        assert_eq!(a.removed, 0);
        assert_eq!(b.removed, 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "counting");
    }
}
