use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::NaiveDateTime;

use super::packet::{Message, QoS};

pub const DEFAULT_LOG_CAPACITY: usize = 500;
const PREVIEW_CHARS: usize = 40;

/// A received message as kept for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub id: u64,
    pub topic: String,
    pub content: String,
    pub qos: QoS,
    pub retain: bool,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for LoggedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if self.content.chars().count() > PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} - {}: {}{}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

impl LoggedMessage {
    pub fn from_message(id: u64, message: &Message) -> Self {
        LoggedMessage {
            id,
            topic: message.topic.clone(),
            content: String::from_utf8_lossy(&message.payload).into_owned(),
            qos: message.qos,
            retain: message.retain,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {} ({}{})\n{}",
            self.timestamp,
            self.topic,
            self.qos,
            if self.retain { ", retained" } else { "" },
            self.content
        )
    }
}

/// One `/`-separated level of the topic tree built by [`MessageLog::tree`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicNode {
    pub segment: String,
    /// Topic up to and including this segment; empty for the root
    pub path: String,
    /// Logged messages whose topic ends exactly here
    pub count: usize,
    pub latest: Option<LoggedMessage>,
    pub children: BTreeMap<String, TopicNode>,
}

impl TopicNode {
    fn insert(&mut self, entry: &LoggedMessage) {
        let mut node = self;
        let mut end = 0;
        for segment in entry.topic.split('/') {
            end += segment.len();
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| TopicNode {
                    segment: segment.to_string(),
                    path: entry.topic[..end].to_string(),
                    ..TopicNode::default()
                });
            end += 1;
        }
        node.count += 1;
        node.latest = Some(entry.clone());
    }

    /// Messages logged at this node and below
    pub fn total(&self) -> usize {
        self.count + self.children.values().map(TopicNode::total).sum::<usize>()
    }

    /// Node for an exact topic, if anything was logged at or below it
    pub fn get(&self, topic: &str) -> Option<&TopicNode> {
        topic
            .split('/')
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    /// Indented outline, one line per node
    pub fn render(&self) -> String {
        let mut out = String::new();
        for child in self.children.values() {
            child.render_into(0, &mut out);
        }
        out
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        let marker = if self.children.is_empty() { "•" } else { "▼" };
        out.push_str(&format!(
            "{}{} {} ({})",
            "  ".repeat(depth),
            marker,
            self.segment,
            self.total()
        ));
        if let Some(latest) = &self.latest {
            let preview: String = latest.content.chars().take(PREVIEW_CHARS).collect();
            out.push_str(&format!(": {}", preview));
        }
        out.push('\n');
        for child in self.children.values() {
            child.render_into(depth + 1, out);
        }
    }
}

/// Bounded history of received messages, newest first
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<LoggedMessage>,
    capacity: usize,
    next_id: u64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl MessageLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    pub fn push(&mut self, message: &Message) -> &LoggedMessage {
        self.next_id += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries
            .push_front(LoggedMessage::from_message(self.next_id, message));
        &self.entries[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoggedMessage> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LoggedMessage> {
        self.entries.front()
    }

    pub fn for_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a LoggedMessage> {
        self.entries.iter().filter(move |m| m.topic == topic)
    }

    /// Groups the logged messages by topic segment
    pub fn tree(&self) -> TopicNode {
        let mut root = TopicNode::default();
        // oldest first so `latest` ends up holding the newest message
        for entry in self.entries.iter().rev() {
            root.insert(entry);
        }
        root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_first_within_capacity() {
        let mut log = MessageLog::with_capacity(3);
        for i in 0..5 {
            log.push(&Message::new("t", format!("{}", i), QoS::AtMostOnce));
        }
        let contents: Vec<&str> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["4", "3", "2"]);
        assert_eq!(log.latest().map(|m| m.id), Some(5));
    }

    #[test]
    fn preview_is_truncated_on_char_boundary() {
        let mut log = MessageLog::default();
        let long = "ä".repeat(60);
        let entry = log.push(&Message::new("sensors/x", long, QoS::AtMostOnce));
        let line = entry.to_string();
        assert!(line.ends_with("..."));
        assert!(line.contains("sensors/x: "));

        let short = log.push(&Message::new("s", "tiny", QoS::AtMostOnce)).to_string();
        assert!(short.ends_with("s: tiny"));
    }

    #[test]
    fn filters_by_topic() {
        let mut log = MessageLog::default();
        log.push(&Message::new("a", "1", QoS::AtMostOnce));
        log.push(&Message::new("b", "2", QoS::AtMostOnce));
        log.push(&Message::new("a", "3", QoS::AtMostOnce));
        assert_eq!(log.for_topic("a").count(), 2);
    }

    #[test]
    fn tree_groups_by_segment() {
        let mut log = MessageLog::default();
        log.push(&Message::new("home/kitchen/temp", "20", QoS::AtMostOnce));
        log.push(&Message::new("home/kitchen/temp", "21", QoS::AtMostOnce));
        log.push(&Message::new("home/hall", "on", QoS::AtMostOnce));
        log.push(&Message::new("home", "root", QoS::AtMostOnce));
        log.push(&Message::new("garage/door", "open", QoS::AtMostOnce));

        let tree = log.tree();
        assert_eq!(tree.total(), 5);
        assert_eq!(
            tree.children.keys().collect::<Vec<_>>(),
            vec!["garage", "home"]
        );

        let home = tree.get("home").unwrap();
        assert_eq!(home.count, 1);
        assert_eq!(home.total(), 4);
        assert_eq!(
            home.children.keys().collect::<Vec<_>>(),
            vec!["hall", "kitchen"]
        );

        let temp = tree.get("home/kitchen/temp").unwrap();
        assert_eq!(temp.path, "home/kitchen/temp");
        assert_eq!(temp.count, 2);
        assert_eq!(temp.latest.as_ref().map(|m| m.content.as_str()), Some("21"));
        assert_eq!(tree.get("home/kitchen").unwrap().latest, None);
        assert!(tree.get("home/cellar").is_none());
    }

    #[test]
    fn empty_segments_are_nodes() {
        let mut log = MessageLog::default();
        log.push(&Message::new("/a//b/", "x", QoS::AtMostOnce));

        let tree = log.tree();
        let leaf = tree.get("/a//b/").unwrap();
        assert_eq!(leaf.segment, "");
        assert_eq!(leaf.path, "/a//b/");
        assert_eq!(tree.get("/a/").unwrap().path, "/a/");
        assert_eq!(tree.get("/a/").unwrap().segment, "");
        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn tree_renders_indented_outline() {
        let mut log = MessageLog::default();
        log.push(&Message::new("a/b", "1", QoS::AtMostOnce));
        log.push(&Message::new("a/c", "2", QoS::AtMostOnce));

        assert_eq!(log.tree().render(), "▼ a (2)\n  • b (1): 1\n  • c (1): 2\n");
    }
}
