fn main() -> snaptrace::anyhow::Result<()> {
    snaptrace::snaptrace_main()
}
