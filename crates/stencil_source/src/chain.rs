//! Ordered fallback over several containers.

use std::collections::HashSet;

use tracing::{trace, warn};

use crate::container::{CacheStatus, Container};
use crate::error::SourceError;
use crate::source::Source;

/// Resolves names against member containers in order.
///
/// The first member that has a name wins. A member that fails aborts the
/// lookup with that error: an unreachable member must not let a later member
/// silently shadow a script it would have provided.
pub struct Chain<C> {
    label: String,
    members: Vec<C>,
}

impl<C: Container> Chain<C> {
    /// Creates a chain over `members`, highest precedence first.
    pub fn new(label: impl Into<String>, members: Vec<C>) -> Self {
        Self {
            label: label.into(),
            members,
        }
    }

    /// Appends a member with the lowest precedence.
    pub fn push(&mut self, member: C) {
        self.members.push(member);
    }

    /// The members in precedence order.
    pub fn members(&self) -> &[C] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the chain has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn fan_out(&self, op: impl Fn(&C) -> CacheStatus) -> CacheStatus {
        let mut any = false;
        let mut removed = 0;
        let mut failures = Vec::new();
        for member in self.members.iter().filter(|m| m.is_cacheable()) {
            any = true;
            match op(member) {
                CacheStatus::Cleared { removed: n } => removed += n,
                CacheStatus::NotACache => {}
                CacheStatus::Failed(msg) => failures.push(format!("{}: {msg}", member.label())),
            }
        }
        if !failures.is_empty() {
            CacheStatus::Failed(failures.join("; "))
        } else if any {
            CacheStatus::Cleared { removed }
        } else {
            CacheStatus::NotACache
        }
    }
}

impl<C: Container> Container for Chain<C> {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        for member in &self.members {
            if let Some(source) = member.lookup(name)? {
                trace!(name, member = member.label(), "resolved in chain");
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    /// Union of member names in first-seen order.
    fn names(&self) -> Result<Vec<String>, SourceError> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for member in &self.members {
            for name in member.names()? {
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Closes every member, reporting the first failure after trying all.
    fn close(&self) -> Result<(), SourceError> {
        let mut first = None;
        for member in &self.members {
            if let Err(e) = member.close() {
                warn!(member = member.label(), error = %e, "failed to close chain member");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn is_cacheable(&self) -> bool {
        self.members.iter().any(C::is_cacheable)
    }

    fn clear_cache(&self) -> CacheStatus {
        self.fan_out(C::clear_cache)
    }

    fn sweep_cache(&self) -> CacheStatus {
        self.fan_out(C::sweep_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContainer;
    use stencil_common::Timestamp;

    fn chain() -> Chain<MemoryContainer> {
        let first = MemoryContainer::new("first");
        first.insert_at("shared", "from first", Timestamp::from_nanos(1));
        first.insert("only-first", "1");
        let second = MemoryContainer::new("second");
        second.insert_at("shared", "from second", Timestamp::from_nanos(2));
        second.insert("only-second", "2");
        Chain::new("chain", vec![first, second])
    }

    #[test]
    fn first_member_wins() {
        let chain = chain();
        let src = chain.lookup("shared").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"from first");
    }

    #[test]
    fn falls_through_to_later_members() {
        let chain = chain();
        let src = chain.lookup("only-second").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"2");
        assert!(chain.lookup("absent").unwrap().is_none());
    }

    #[test]
    fn member_error_is_not_absence() {
        let chain = chain();
        chain.members()[0].close().unwrap();
        assert!(matches!(chain.lookup("only-second"), Err(SourceError::Closed(l)) if l == "first"));
    }

    #[test]
    fn names_are_a_deduplicated_union() {
        let chain = chain();
        assert_eq!(
            chain.names().unwrap(),
            vec!["only-first", "shared", "only-second"]
        );
    }

    #[test]
    fn management_without_cache_members() {
        let chain = chain();
        assert!(!chain.is_cacheable());
        assert_eq!(chain.clear_cache(), CacheStatus::NotACache);
        assert_eq!(chain.sweep_cache(), CacheStatus::NotACache);
    }

    #[test]
    fn empty_chain_finds_nothing() {
        let chain: Chain<MemoryContainer> = Chain::new("empty", Vec::new());
        assert!(chain.is_empty());
        assert!(chain.lookup("x").unwrap().is_none());
        assert!(chain.names().unwrap().is_empty());
    }

    #[test]
    fn close_closes_all_members() {
        let chain = chain();
        chain.close().unwrap();
        for member in chain.members() {
            assert!(member.is_empty());
        }
    }
}
