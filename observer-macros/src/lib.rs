
use proc_macro::TokenStream;

/// Runs an async test against a fresh in-memory `Network` of validators, once per RNG seed.
///
/// The seed comes from `OBSERVER_TEST_RNG_SEED` if it is set. Otherwise `OBSERVER_TEST_SAMPLES` seeds (default 1) are
/// run in parallel.
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
