//! Buffered write queue shared by the stores.
//!
//! Records are released in full batches once the threshold is reached and in
//! one final partial batch on [`WriteQueue::drain`]. Batches whose write fails
//! go back with [`WriteQueue::restore`]; anything still buffered is lost only
//! if the process dies before a flush.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct WriteQueue<T> {
    items: VecDeque<T>,
    batch_size: usize,
}

impl<T> WriteQueue<T> {
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    /// Remove every complete batch currently buffered.
    pub fn take_full(&mut self) -> Vec<Vec<T>> {
        let mut batches = Vec::new();
        while self.items.len() >= self.batch_size {
            batches.push(self.items.drain(..self.batch_size).collect());
        }
        batches
    }

    /// Remove everything, full batches first, then the partial tail.
    pub fn drain(&mut self) -> Vec<Vec<T>> {
        let mut batches = self.take_full();
        if !self.items.is_empty() {
            batches.push(self.items.drain(..).collect());
        }
        batches
    }

    /// Put unwritten batches back at the front, ahead of anything queued since.
    pub fn restore(&mut self, batches: impl IntoIterator<Item = Vec<T>>) {
        let items: Vec<T> = batches.into_iter().flatten().collect();
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
