//! Topic trie
//!
//! Filters are stored level by level. Literal levels live in a hash map,
//! `+` gets a dedicated child and `#` terminates at the node of its parent
//! level, so a lookup for a concrete topic only walks the branches that can
//! possibly match.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    /// Value for `<path to this node>/#`
    multi_wildcard: Option<V>,
    single_wildcard: Option<Box<TrieNode<V>>>,
    children: AHashMap<CompactString, TrieNode<V>>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            multi_wildcard: None,
            single_wildcard: None,
            children: AHashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }

    fn child_count(&self) -> usize {
        self.children.len() + usize::from(self.single_wildcard.is_some())
    }

    fn child(&self, level: &str) -> Option<&TrieNode<V>> {
        if level == "+" {
            self.single_wildcard.as_deref()
        } else {
            self.children.get(level)
        }
    }

    fn child_mut(&mut self, level: &str) -> Option<&mut TrieNode<V>> {
        if level == "+" {
            self.single_wildcard.as_deref_mut()
        } else {
            self.children.get_mut(level)
        }
    }
}

/// Map from topic filter to `V` with wildcard-aware lookup
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Number of filters stored
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot for `filter`, created with `V::default()` if absent
    pub fn entry(&mut self, filter: &str) -> &mut V
    where
        V: Default,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return Self::fill(&mut node.multi_wildcard, &mut self.len);
            }
            node = if level == "+" {
                node.single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children
                    .entry(CompactString::new(level))
                    .or_insert_with(TrieNode::new)
            };
            if levels.peek().is_none() {
                break;
            }
        }
        Self::fill(&mut node.value, &mut self.len)
    }

    fn fill<'a>(slot: &'a mut Option<V>, len: &mut usize) -> &'a mut V
    where
        V: Default,
    {
        if slot.is_none() {
            *len += 1;
        }
        slot.get_or_insert_with(V::default)
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            }
            node = if level == "+" {
                node.single_wildcard.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };
            if levels.peek().is_none() {
                break;
            }
        }
        node.value.as_mut()
    }

    /// Remove the value stored for `filter`, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let (path, multi) = match levels.split_last() {
            Some((&"#", parent)) => (parent, true),
            _ => (&levels[..], false),
        };

        let mut node = &mut self.root;
        for &level in path {
            node = node.child_mut(level)?;
        }
        let slot = if multi {
            &mut node.multi_wildcard
        } else {
            &mut node.value
        };
        let removed = slot.take()?;
        self.len -= 1;
        self.prune(path);
        Some(removed)
    }

    /// Detach the longest tail of `path` that only leads to empty nodes
    fn prune(&mut self, path: &[&str]) {
        let mut keep = 0;
        let mut node = &self.root;
        for (depth, &level) in path.iter().enumerate() {
            if node.value.is_some() || node.multi_wildcard.is_some() || node.child_count() > 1 {
                keep = depth;
            }
            match node.child(level) {
                Some(child) => node = child,
                None => return,
            }
        }
        if path.is_empty() || !node.is_empty() {
            return;
        }

        let mut parent = &mut self.root;
        for &level in &path[..keep] {
            parent = match parent.child_mut(level) {
                Some(child) => child,
                None => return,
            };
        }
        let detached = match path[keep] {
            "+" => parent.single_wildcard.take().map(|child| *child),
            level => parent.children.remove(level),
        };
        if let Some(node) = detached {
            release(node);
        }
    }

    /// Visit every value whose filter matches the concrete `topic`.
    ///
    /// Visit order depends only on the trie contents: `#` at a level, then
    /// the `+` branch, then the literal branch.
    pub fn for_each_match<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        // Wildcards at the first level never select `$` topics
        let dollar = topic.starts_with('$');

        let mut pending: SmallVec<[(&TrieNode<V>, usize, bool); 16]> = SmallVec::new();
        pending.push((&self.root, 0, !dollar));

        while let Some((node, depth, wildcards)) = pending.pop() {
            if wildcards {
                if let Some(ref v) = node.multi_wildcard {
                    visit(v);
                }
            }

            let Some(&level) = levels.get(depth) else {
                if let Some(ref v) = node.value {
                    visit(v);
                }
                continue;
            };

            // Pushed in reverse so the `+` branch is visited first
            if let Some(child) = node.children.get(level) {
                pending.push((child, depth + 1, true));
            }
            if wildcards {
                if let Some(child) = node.single_wildcard.as_deref() {
                    pending.push((child, depth + 1, true));
                }
            }
        }
    }
}

/// Drop a subtree without recursing once per level
fn release<V>(node: TrieNode<V>) {
    let mut stack = vec![node];
    while let Some(mut node) = stack.pop() {
        stack.extend(node.children.drain().map(|(_, child)| child));
        if let Some(child) = node.single_wildcard.take() {
            stack.push(*child);
        }
    }
}

impl<V> Drop for TopicTrie<V> {
    fn drop(&mut self) {
        let root = std::mem::replace(&mut self.root, TrieNode::new());
        release(root);
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
