pub mod sleep_lock;
pub mod spin_lock;

pub use self::{
    sleep_lock::{SleepLock, SleepLockGuard},
    spin_lock::{RawSpinLock, SpinLock, SpinLockCondVar, SpinLockGuard},
};
