use std::fmt::Debug;

/// Narrowing conversion for values whose range was checked before, e.g. a PDU length that was
///  checked against the configured MTU, or a frame length against the link's frame size.
///
/// NB: Converting a value outside the target range is a bug, and panics
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl<S, T> PrecheckedCast<T> for S
where
    S: TryInto<T> + Copy + Debug,
{
    fn prechecked_cast(self) -> T {
        match self.try_into() {
            Ok(value) => value,
            Err(_) => panic!("{:?} is out of range for {} - this is a bug", self, std::any::type_name::<T>()),
        }
    }
}
