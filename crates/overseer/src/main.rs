use owo_colors::OwoColorize as _;

fn main() {
  env_logger::Builder::from_env(env_logger::Env::new().filter_or("OVERSEER_LOG", "warn")).init();
  if let Err(err) = overseer::run() {
    anstream::eprintln!("{}", format!("{err:#}").red());
    let code = if err.downcast_ref::<overseer::Blocked>().is_some() {
      2
    } else {
      1
    };
    std::process::exit(code);
  }
}
