use low_memory_monitor::dispatch;

fn main() -> anyhow::Result<()> {
    dispatch()
}
