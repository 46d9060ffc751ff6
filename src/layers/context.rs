use crate::error::{CellError, Result};
use crate::layers::recurrent::RecurrentCell;
use tracing::trace;

/// 让单元找到它在序列中的前一个和后一个单元，而不持有它们。
pub trait ContextWindow<C> {
    fn previous(&self) -> Option<&C>;
    fn next(&self) -> Option<&C>;
}

/// 没有邻居的窗口，用于单步计算。
#[derive(Clone, Copy, Debug, Default)]
pub struct Isolated;

impl<C> ContextWindow<C> for Isolated {
    fn previous(&self) -> Option<&C> {
        None
    }

    fn next(&self) -> Option<&C> {
        None
    }
}

/// 由外部持有的连续单元数组切出的窗口：邻居按下标算出，不保存指针。
#[derive(Debug)]
pub struct SequenceWindow<'a, C> {
    before: &'a [C],
    after: &'a [C],
}

impl<'a, C> SequenceWindow<'a, C> {
    pub fn new(before: &'a [C], after: &'a [C]) -> Self {
        Self { before, after }
    }
}

impl<C> ContextWindow<C> for SequenceWindow<'_, C> {
    fn previous(&self) -> Option<&C> {
        self.before.last()
    }

    fn next(&self) -> Option<&C> {
        self.after.first()
    }
}

/// 取出第 `index` 个单元的可变引用，以及指向其余单元的只读窗口。
pub fn split_at_step<C>(cells: &mut [C], index: usize) -> Result<(&mut C, SequenceWindow<'_, C>)> {
    let len = cells.len();
    let (before, rest) = cells.split_at_mut(index.min(len));
    match rest.split_first_mut() {
        Some((current, after)) => Ok((current, SequenceWindow::new(before, after))),
        None => Err(CellError::shape("split_at_step", &[len], &[index + 1])),
    }
}

/// 按序列位置复用单元实例的池。
///
/// 归序列处理单元独占，不是线程安全的；每次 [`CellPool::release_all`] 递增代数。
#[derive(Debug)]
pub struct CellPool<C> {
    cells: Vec<C>,
    in_use: usize,
    generation: u64,
}

impl<C> Default for CellPool<C> {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            in_use: 0,
            generation: 0,
        }
    }
}

impl<C: RecurrentCell> CellPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取下一个空闲单元，返回它的下标。已有单元会先被重置，不够时用 `make` 新建。
    pub fn acquire<F>(&mut self, make: F) -> Result<usize>
    where
        F: FnOnce() -> Result<C>,
    {
        if self.in_use < self.cells.len() {
            self.cells[self.in_use].reset();
        } else {
            self.cells.push(make()?);
        }
        let index = self.in_use;
        self.in_use += 1;
        Ok(index)
    }

    /// 释放所有单元以便下一条序列复用。
    pub fn release_all(&mut self) {
        trace!(
            released = self.in_use,
            generation = self.generation,
            "cell pool released"
        );
        self.in_use = 0;
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// 已分配的单元总数（含空闲）。
    pub fn allocated(&self) -> usize {
        self.cells.len()
    }

    pub fn active(&self) -> &[C] {
        &self.cells[..self.in_use]
    }

    pub fn active_mut(&mut self) -> &mut [C] {
        &mut self.cells[..self.in_use]
    }
}
