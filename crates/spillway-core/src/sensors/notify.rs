/// Who should hear about a freshly appended sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification<'a> {
    /// A single registered consumer, addressed by its id
    One(&'a str),
    /// Every consumer of the named stream
    All(&'a str),
}

impl<'a> Notification<'a> {
    pub const fn for_append(stream: &'a str, id: Option<&'a str>) -> Self {
        match id {
            Some(id) => Self::One(id),
            None => Self::All(stream),
        }
    }
}

/// The consumer registry a sensor instance reports to.
///
/// Owned by the notification subsystem; the buffering engine only delivers
/// notifications and asks how many consumers are still registered.
pub trait ConsumerHub {
    fn notify(&self, notification: Notification<'_>);

    fn active_consumers(&self) -> usize;
}

impl<H: ConsumerHub + ?Sized> ConsumerHub for &H {
    fn notify(&self, notification: Notification<'_>) {
        (**self).notify(notification)
    }

    fn active_consumers(&self) -> usize {
        (**self).active_consumers()
    }
}
