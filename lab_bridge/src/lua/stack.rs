use super::{ResultOrError, ScriptVm};

/// Restores the VM stack depth found on entry when dropped.
///
/// Results a block wants to hand back are pushed last and then kept with
/// [`StackScope::keep`], which slides them down onto the entry depth;
/// everything else the block pushed is discarded on drop, on every path.
pub struct StackScope<'vm> {
    vm: &'vm ScriptVm,
    depth: usize,
    kept: usize,
}

impl<'vm> StackScope<'vm> {
    pub fn new(vm: &'vm ScriptVm) -> Self {
        Self {
            vm,
            depth: vm.depth(),
            kept: 0,
        }
    }

    /// Depth recorded on entry.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Leave the top `count` values on the stack above the entry depth.
    pub fn keep(mut self, count: usize) -> ResultOrError {
        match self.vm.settle(self.depth, count) {
            Ok(()) => {
                self.kept = self.vm.depth() - self.depth;
                ResultOrError::count(self.kept)
            }
            Err(err) => ResultOrError::from(err),
        }
    }
}

impl Drop for StackScope<'_> {
    fn drop(&mut self) {
        self.vm.truncate(self.depth + self.kept);
    }
}
