fn main() {
    let exit_code = match dynbuild::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("dynbuild: error: {}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
