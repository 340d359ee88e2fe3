fn main() -> Result<(), Box<dyn std::error::Error>> {
    chatosophy::cli::main()
}
