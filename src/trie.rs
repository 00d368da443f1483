use std::collections::HashMap;

/// A byte-keyed prefix tree.
///
/// Backs the command table's prefix-policy lookups: `longest_prefix`
/// finds the longest stored key that is a prefix of the probe.
#[derive(Debug, Default)]
pub struct Trie<T> {
    root: Node<T>,
}

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    children: HashMap<u8, Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            value: None,
            children: HashMap::new(),
        }
    }
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Trie {
            root: Node::default(),
        }
    }

    pub fn insert(&mut self, key: &str, value: T) {
        let mut node = &mut self.root;
        for &b in key.as_bytes() {
            node = node.children.entry(b).or_default();
        }
        node.value = Some(value);
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &str) -> Option<&T> {
        let mut node = &self.root;
        for &b in key.as_bytes() {
            node = node.children.get(&b)?;
        }
        node.value.as_ref()
    }

    /// Walk as far as the probe allows and return the longest stored key
    /// on that path together with its value.
    pub fn longest_prefix<'a>(&self, probe: &'a str) -> Option<(&'a str, &T)> {
        let mut node = &self.root;
        let mut best: Option<(usize, &T)> = None;

        for (i, &b) in probe.as_bytes().iter().enumerate() {
            match node.children.get(&b) {
                Some(next) => {
                    node = next;
                    if let Some(value) = &node.value {
                        best = Some((i + 1, value));
                    }
                }
                None => break,
            }
        }

        best.map(|(len, value)| (&probe[..len], value))
    }
}
