//! VM Configuration
//!
//! Address-space layout and stack-growth limits. The defaults follow the
//! x86-64 teaching-kernel layout: user stack just below 0x4748_0000 and the
//! kernel half starting at 0x80_0400_0000.

use super::PAGE_SIZE;

// ============================================================================
// Defaults
// ============================================================================

/// Top of the user stack (first address above the initial stack page)
pub const USER_STACK: u64 = 0x4748_0000;

/// First kernel virtual address
pub const KERN_BASE: u64 = 0x80_0400_0000;

/// Largest the user stack may grow (1 MiB)
pub const STACK_MAX: u64 = 1 << 20;

/// Bytes below the stack pointer that still count as a stack access.
/// `push` faults 8 bytes below %rsp before the pointer moves.
pub const STACK_GUARD: u64 = 8;

// ============================================================================
// VmConfig
// ============================================================================

/// Tunables consulted by the fault resolver and mmap validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Top of the user stack
    pub user_stack: u64,
    /// Start of kernel space; user mappings must end at or below it
    pub kern_base: u64,
    /// Maximum stack size in bytes
    pub stack_max: u64,
    /// Slack below %rsp accepted for stack growth
    pub stack_guard: u64,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        user_stack: USER_STACK,
        kern_base: KERN_BASE,
        stack_max: STACK_MAX,
        stack_guard: STACK_GUARD,
    };

    pub const fn with_user_stack(mut self, user_stack: u64) -> Self {
        self.user_stack = user_stack;
        self
    }

    pub const fn with_kern_base(mut self, kern_base: u64) -> Self {
        self.kern_base = kern_base;
        self
    }

    pub const fn with_stack_max(mut self, stack_max: u64) -> Self {
        self.stack_max = stack_max;
        self
    }

    pub const fn with_stack_guard(mut self, stack_guard: u64) -> Self {
        self.stack_guard = stack_guard;
        self
    }

    /// Lowest address the stack may grow down to
    pub const fn stack_limit(&self) -> u64 {
        self.user_stack.saturating_sub(self.stack_max)
    }

    /// Maximum number of stack pages
    pub const fn stack_max_pages(&self) -> u64 {
        self.stack_max / PAGE_SIZE as u64
    }

    /// Check if an address lies in kernel space
    pub const fn is_kernel_vaddr(&self, addr: u64) -> bool {
        addr >= self.kern_base
    }

    /// Check if an address lies in user space
    pub const fn is_user_vaddr(&self, addr: u64) -> bool {
        !self.is_kernel_vaddr(addr)
    }

    /// Decide whether a fault at `addr` with stack pointer `rsp` may grow the stack
    pub const fn allows_stack_growth(&self, addr: u64, rsp: u64) -> bool {
        addr < self.user_stack
            && addr >= self.stack_limit()
            && addr >= rsp.saturating_sub(self.stack_guard)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = VmConfig::default();
        assert_eq!(config.stack_limit(), USER_STACK - STACK_MAX);
        assert_eq!(config.stack_max_pages(), 256);
        assert!(config.is_kernel_vaddr(KERN_BASE));
        assert!(config.is_user_vaddr(KERN_BASE - 1));
    }

    #[test]
    fn test_stack_growth_window() {
        let config = VmConfig::DEFAULT;
        let rsp = USER_STACK - 0x2000;

        assert!(config.allows_stack_growth(rsp - 8, rsp));
        assert!(config.allows_stack_growth(rsp + 16, rsp));
        assert!(!config.allows_stack_growth(rsp - 4096, rsp));
        assert!(!config.allows_stack_growth(USER_STACK, USER_STACK));
        assert!(!config.allows_stack_growth(config.stack_limit() - 8, 0));
    }

    #[test]
    fn test_builder() {
        let config = VmConfig::DEFAULT.with_stack_max(8 * 4096).with_stack_guard(32);
        assert_eq!(config.stack_max_pages(), 8);
        assert_eq!(config.stack_guard, 32);
    }
}
