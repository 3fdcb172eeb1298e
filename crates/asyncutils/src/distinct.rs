use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Stream for the [`distinct_until_changed_by`](StreamDistinctExt::distinct_until_changed_by)
    /// method.
    #[must_use = "streams do nothing unless polled"]
    pub struct DistinctUntilChanged<S, T, F> {
        #[pin]
        stream: S,
        last: Option<T>,
        eq: F,
    }
}

impl<S, F> Stream for DistinctUntilChanged<S, S::Item, F>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(&S::Item, &S::Item) -> bool,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let Some(item) = ready!(this.stream.as_mut().poll_next(cx)) else {
                return Poll::Ready(None);
            };
            if let Some(last) = this.last.as_ref()
                && (this.eq)(last, &item)
            {
                continue;
            }
            *this.last = Some(item.clone());
            return Poll::Ready(Some(item));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lower, upper) = self.stream.size_hint();
        (lower.min(1), upper)
    }
}

/// Suppress consecutive duplicate items of a stream.
pub trait StreamDistinctExt: Stream + Sized {
    /// Skip every item that `eq` considers equal to the last item yielded.
    fn distinct_until_changed_by<F>(self, eq: F) -> DistinctUntilChanged<Self, Self::Item, F>
    where
        F: FnMut(&Self::Item, &Self::Item) -> bool,
    {
        DistinctUntilChanged { stream: self, last: None, eq }
    }

    /// Skip every item equal (by [`PartialEq`]) to the last item yielded.
    fn distinct_until_changed(self) -> DistinctUntilChanged<Self, Self::Item, fn(&Self::Item, &Self::Item) -> bool>
    where
        Self::Item: PartialEq,
    {
        self.distinct_until_changed_by(<Self::Item as PartialEq>::eq)
    }
}

impl<S: Stream> StreamDistinctExt for S {}
