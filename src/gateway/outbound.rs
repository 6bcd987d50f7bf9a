//! 出站队列：断线期间暂存序列化后的信封
//!
//! 有界 FIFO，满时先淘汰最旧的条目再追加（有损降级，不报错）。

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<String>,
    limit: usize,
    dropped: u64,
}

impl OutboundQueue {
    /// limit 为 0 时按 1 处理
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            items: VecDeque::with_capacity(limit.min(1024)),
            limit,
            dropped: 0,
        }
    }

    /// 追加到队尾；返回被淘汰的最旧条目
    pub fn push(&mut self, frame: String) -> Option<String> {
        let evicted = if self.items.len() >= self.limit {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(frame);
        evicted
    }

    /// 发送失败时放回队首，保持原有顺序
    pub fn push_front(&mut self, frame: String) {
        self.items.push_front(frame);
        while self.items.len() > self.limit {
            self.dropped += 1;
            self.items.pop_back();
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 累计淘汰条数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.items.iter()
    }
}
