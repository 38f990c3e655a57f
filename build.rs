fn main() {
    #[cfg(feature = "redis-store")]
    {
        #[cfg(not(any(feature = "json", feature = "messagepack")))]
        compile_error!(
            "redis-store feature requires either 'json' or 'messagepack' feature to be enabled"
        );

        #[cfg(all(feature = "json", feature = "messagepack"))]
        compile_error!("Cannot enable both 'json' and 'messagepack' features simultaneously");
    }
}
