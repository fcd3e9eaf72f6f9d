// Virtual-time event scheduler.  The queue is a delta list: nodes are kept in
// firing order and each node stores only its delay relative to the previous
// node, so inserting at position k never touches the tail and cancellation
// gives the removed node's delta to its successor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::device::DevRef;

struct Node {
    dev: DevRef,
    arg: i32,
    delta: u32,
}

#[derive(Default)]
struct SchedInner {
    queue: VecDeque<Node>,
    immediate: VecDeque<(DevRef, i32)>,
    depth: u32,
}

/// Cheaply cloneable handle to the scheduler, passed to every device at
/// construction.
#[derive(Clone)]
pub struct Sched {
    inner: Rc<RefCell<SchedInner>>,
}

/// Marks a region where device code is running (and therefore borrowed).
/// Zero-delta events inserted inside the region are deferred until the
/// outermost guard drops.
pub struct DispatchGuard {
    sched: Sched,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let depth = {
            let mut inner = self.sched.inner.borrow_mut();
            inner.depth -= 1;
            inner.depth
        };
        if depth == 0 {
            self.sched.flush_immediate();
        }
    }
}

impl Sched {
    pub fn new() -> Sched {
        Sched { inner: Rc::new(RefCell::new(SchedInner::default())) }
    }

    pub fn enter(&self) -> DispatchGuard {
        self.inner.borrow_mut().depth += 1;
        DispatchGuard { sched: self.clone() }
    }

    /// Schedules `dev.srv(arg)` to fire `delta` virtual-time units from now.
    /// A zero delta fires synchronously before returning, unless device code
    /// is currently on the stack, in which case it fires right after the
    /// current callback returns, in insertion order.
    pub fn add_event(&self, dev: &DevRef, arg: i32, delta: u32) {
        if delta == 0 {
            let deferred = {
                let mut inner = self.inner.borrow_mut();
                inner.immediate.push_back((Rc::clone(dev), arg));
                inner.depth > 0
            };
            if !deferred {
                self.flush_immediate();
            }
            return;
        }
        let mut inner = self.inner.borrow_mut();
        let mut remaining = delta;
        let mut at = inner.queue.len();
        for (i, node) in inner.queue.iter().enumerate() {
            if remaining < node.delta {
                at = i;
                break;
            }
            remaining -= node.delta;
        }
        if let Some(next) = inner.queue.get_mut(at) {
            next.delta -= remaining;
        }
        inner.queue.insert(at, Node { dev: Rc::clone(dev), arg, delta: remaining });
    }

    /// Removes the first queued event matching both the device identity and
    /// the argument.  Missing events are a silent no-op; other firing times
    /// are unchanged.
    pub fn cancel_event(&self, dev: &DevRef, arg: i32) {
        let mut inner = self.inner.borrow_mut();
        if let Some(i) = inner
            .queue
            .iter()
            .position(|n| n.arg == arg && Rc::ptr_eq(&n.dev, dev))
        {
            let delta = inner.queue[i].delta;
            inner.queue.remove(i);
            if let Some(next) = inner.queue.get_mut(i) {
                next.delta += delta;
            }
        } else if let Some(i) = inner
            .immediate
            .iter()
            .position(|(d, a)| *a == arg && Rc::ptr_eq(d, dev))
        {
            inner.immediate.remove(i);
        }
    }

    /// Advances virtual time by `units`, firing every due callback at its own
    /// instant so that re-scheduling from inside a callback stays relative to
    /// the instant the callback fired.
    pub fn advance(&self, units: u32) {
        let mut left = units;
        loop {
            self.flush_immediate();
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.queue.front_mut() {
                    None => return,
                    Some(head) if head.delta > left => {
                        head.delta -= left;
                        return;
                    }
                    Some(head) => {
                        left -= head.delta;
                        head.delta = 0;
                        inner.queue.pop_front()
                    }
                }
            };
            if let Some(node) = due {
                self.fire(node.dev, node.arg);
            }
        }
    }

    /// Number of queued (non-immediate) events; used by tests and by show
    /// commands.
    pub fn len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }

    fn fire(&self, dev: DevRef, arg: i32) {
        let guard = self.enter();
        dev.borrow_mut().srv(arg);
        drop(guard);
    }

    fn flush_immediate(&self) {
        loop {
            let next = self.inner.borrow_mut().immediate.pop_front();
            match next {
                Some((dev, arg)) => self.fire(dev, arg),
                None => return,
            }
        }
    }
}
