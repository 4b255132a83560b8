// ---------------------------------------------------------------------------
// QuoteCache -- last known top of book for one symbol
// ---------------------------------------------------------------------------
//
// Streamed quotes are partial: a level-one update only carries the fields that
// changed.  The cache keeps the merged view; fields missing from an update
// never erase what is already known.  There is no timestamp-based discard.

use crate::types::Quote;

#[derive(Debug, Default)]
pub struct QuoteCache {
    quote: Option<Quote>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `update` and return the merged quote.
    pub fn on_quote(&mut self, update: Quote) -> &Quote {
        let known = self.quote.get_or_insert_with(|| Quote {
            symbol: update.symbol.clone(),
            ..Quote::default()
        });
        if update.bid.is_some() {
            known.bid = update.bid;
        }
        if update.ask.is_some() {
            known.ask = update.ask;
        }
        if update.last.is_some() {
            known.last = update.last;
        }
        known
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: Option<f64>, ask: Option<f64>, last: Option<f64>) -> Quote {
        Quote {
            symbol: "XYZ".into(),
            bid,
            ask,
            last,
        }
    }

    #[test]
    fn first_quote_is_stored_verbatim() {
        let mut cache = QuoteCache::new();
        let q = quote(Some(1.0), None, Some(1.5));
        assert_eq!(cache.on_quote(q.clone()), &q);
    }

    #[test]
    fn partial_updates_merge_field_by_field() {
        let mut cache = QuoteCache::new();
        cache.on_quote(quote(Some(1.0), Some(2.0), None));
        let merged = cache.on_quote(quote(None, None, Some(1.5))).clone();
        assert_eq!(merged, quote(Some(1.0), Some(2.0), Some(1.5)));

        let merged = cache.on_quote(quote(Some(1.1), None, None)).clone();
        assert_eq!(merged, quote(Some(1.1), Some(2.0), Some(1.5)));
    }

    #[test]
    fn empty_update_changes_nothing() {
        let mut cache = QuoteCache::new();
        cache.on_quote(quote(Some(1.0), Some(2.0), Some(1.5)));
        let merged = cache.on_quote(quote(None, None, None));
        assert_eq!(merged, &quote(Some(1.0), Some(2.0), Some(1.5)));
    }
}
