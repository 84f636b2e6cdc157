fn main() {
    #[cfg(not(any(feature = "bincode", feature = "messagepack")))]
    compile_error!("session payloads require either the 'bincode' or 'messagepack' feature");

    #[cfg(all(feature = "bincode", feature = "messagepack"))]
    compile_error!("Cannot enable both 'bincode' and 'messagepack' features simultaneously");
}
