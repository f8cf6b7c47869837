use std::collections::BinaryHeap;

use super::Neighbor;

/// 保留距离最小的 k 个近邻
///
/// 使用大顶堆，堆顶为当前保留结果中最差的一个。
/// 距离相同时行号较大的更差，因此结果与扫描顺序无关。
pub struct TopKNeighbors {
    heap: BinaryHeap<Neighbor>,
    k: usize,
}

impl TopKNeighbors {
    pub fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    pub fn push(&mut self, neighbor: Neighbor) {
        if self.heap.len() < self.k {
            self.heap.push(neighbor);
        } else if let Some(worst) = self.heap.peek() {
            if neighbor < *worst {
                self.heap.pop();
                self.heap.push(neighbor);
            }
        }
    }

    pub fn extend(&mut self, neighbors: impl IntoIterator<Item = Neighbor>) {
        for neighbor in neighbors {
            self.push(neighbor);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// 按距离升序输出，距离相同时按行号升序
    pub fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}
